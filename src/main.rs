use omsi_recover::*;

use std::path::PathBuf;

use clap::Parser;

/// Recover procedure structure from OMSI Pascal object code
#[derive(Parser, Debug)]
#[clap(about, version, author)]
enum Args {
    /// Recover procedures from a textual disassembly listing
    FromListing {
        /// Path to the listing: a `LISTING` header followed by `MEMORY`, `RUNTIME`, `LABELS`,
        /// `ENTRY` and `CODE` sections
        listing: PathBuf,
        /// Path to output file for the per-function listing, call graph and diagnostics
        #[clap(long)]
        output_listing: Option<PathBuf>,
        /// Output the basic-block graph of every function as GraphViz `.dot` to the given path
        #[clap(long)]
        output_graphviz: Option<PathBuf>,
        /// Disable terminal logging, even for high severity alerts. Strongly discouraged for normal
        /// use.
        #[clap(long)]
        debug_disable_terminal_logging: bool,
        /// Force blocking for terminal logging. If too many messages are being spewed the logger,
        /// by default, does not block, but instead dumps a dropped-messages alert. This option
        /// forces it to block and dump even if too many are being sent.
        #[clap(long)]
        debug_forced_blocking_terminal_logging: bool,
        /// Path to send log (as JSON) to
        ///
        /// Error or higher severity alerts will still continue being shown at stderr (in addition
        /// to being added to the log)
        #[clap(long = "--log")]
        log_file: Option<PathBuf>,
        /// Debug level (repeat for more: 0-warn, 1-info, 2-debug, 3-trace)
        #[clap(short, long, parse(from_occurrences))]
        debug: usize,
        /// Advanced configuration options to tweak the analysis
        #[clap(short = 'Z', long, arg_enum)]
        advanced_config: Vec<analysis_config::CommandLineAnalysisConfig>,
    },
}

fn write_or_print(path: Option<PathBuf>, contents: &str) -> std::io::Result<()> {
    match path {
        Some(path) => std::fs::write(path, contents),
        None => {
            println!("{}", contents);
            Ok(())
        }
    }
}

fn main() {
    let args = Args::parse();

    match args {
        Args::FromListing {
            listing,
            output_listing,
            output_graphviz,
            debug_disable_terminal_logging,
            debug_forced_blocking_terminal_logging,
            log_file,
            debug,
            advanced_config,
        } => {
            let _log_guard = slog_scope::set_global_logger(crate::log::FileAndTermDrain::new(
                debug,
                debug_disable_terminal_logging,
                debug_forced_blocking_terminal_logging,
                log_file,
            ));

            analysis_config::AnalysisConfig::initialize(advanced_config);

            let text = match std::fs::read_to_string(&listing) {
                Ok(text) => text,
                Err(e) => {
                    eprintln!("Could not read {}: {}", listing.display(), e);
                    std::process::exit(1);
                }
            };
            let listing = match listing_lifter::lift_from(&text) {
                Ok(listing) => listing,
                Err(e) => {
                    eprintln!("Could not lift listing: {}", e);
                    std::process::exit(1);
                }
            };
            let mut session = discovery::Session::new(listing);
            session.run();

            let report = render::render_session(&session)
                + "\n"
                + &render::render_annotations(&session.provider);
            if let Err(e) = write_or_print(output_listing, &report) {
                eprintln!("Could not write listing: {}", e);
                std::process::exit(1);
            }

            if let Some(path) = output_graphviz {
                let mut dot: Vec<u8> = vec![];
                let written = session
                    .functions
                    .values()
                    .filter(|f| f.discovered)
                    .try_for_each(|f| render::write_dot(f, &session.provider, &mut dot))
                    .and_then(|()| std::fs::write(path, dot));
                if let Err(e) = written {
                    eprintln!("Could not write graph: {}", e);
                    std::process::exit(1);
                }
            }

            log::trace!("Done");
        }
    }
}
