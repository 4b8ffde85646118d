//! An abstract model of the operand stack, used to replay a block and recover the literal
//! operands and argument layouts of calls.
//!
//! Offsets are in bytes, measured from the top of the stack (offset 0 is the most recently pushed
//! byte). Once tracking is lost the stack is _mangled_ and stays that way; every further operation
//! is a no-op and every query comes back empty.

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Content {
    Unknown,
    SmallInt(i64),
    LongInt(i64),
    /// Raw bytes in image order, if they could be read
    Blob(Option<Vec<u8>>),
    /// Address of the stack location `offset` bytes above the top at the time the reference
    /// was pushed
    BackReference(i64),
    /// Address of the frame slot at `offset`
    FrameReference(i64),
    StringRef(Option<String>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackItem {
    pub width: u64,
    pub content: Content,
}

impl StackItem {
    pub fn unknown(width: u64) -> Self {
        StackItem {
            width,
            content: Content::Unknown,
        }
    }
}

impl std::fmt::Display for StackItem {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.content {
            Content::Unknown => write!(f, "?{}", self.width),
            Content::SmallInt(v) => write!(f, "#{}", v),
            Content::LongInt(v) => write!(f, "#{}L", v),
            Content::Blob(Some(b)) => {
                write!(f, "blob{}:", self.width)?;
                for x in b {
                    write!(f, "{:02x}", x)?;
                }
                Ok(())
            }
            Content::Blob(None) => write!(f, "blob{}:?", self.width),
            Content::BackReference(o) => write!(f, "&sp{:+}", o),
            Content::FrameReference(o) => write!(f, "&fp{:+}", o),
            Content::StringRef(Some(t)) => write!(f, "{:?}", t),
            Content::StringRef(None) => write!(f, "str{}", self.width),
        }
    }
}

/// Top-biased sequence of stack items; the last item is the top of the stack.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SymbolicStack {
    items: Vec<StackItem>,
    mangled: bool,
}

impl SymbolicStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// A stack holding `width` bytes of unknown content
    pub fn with_unknown(width: u64) -> Self {
        let mut s = Self::new();
        s.push(StackItem::unknown(width));
        s
    }

    pub fn is_mangled(&self) -> bool {
        self.mangled
    }

    /// Abandon tracking for good
    pub fn mangle(&mut self) {
        self.mangled = true;
        self.items.clear();
    }

    pub fn items(&self) -> &[StackItem] {
        &self.items
    }

    pub fn total_width(&self) -> u64 {
        self.items.iter().map(|i| i.width).sum()
    }

    pub fn push(&mut self, item: StackItem) {
        if self.mangled || item.width == 0 {
            return;
        }
        if let (Content::Unknown, Some(top)) = (&item.content, self.items.last_mut()) {
            if top.content == Content::Unknown {
                top.width += item.width;
                return;
            }
        }
        self.items.push(item);
    }

    /// Remove `width` bytes from the top, returning the removed items top first. An item only
    /// partially covered is split, and both halves lose their content.
    pub fn pop(&mut self, width: u64) -> Vec<StackItem> {
        let mut popped = vec![];
        let mut remaining = width;
        while remaining > 0 && !self.mangled {
            match self.items.pop() {
                None => self.mangle(),
                Some(top) if top.width <= remaining => {
                    remaining -= top.width;
                    popped.push(top);
                }
                Some(top) => {
                    self.items.push(StackItem::unknown(top.width - remaining));
                    popped.push(StackItem::unknown(remaining));
                    remaining = 0;
                }
            }
        }
        if self.mangled {
            vec![]
        } else {
            popped
        }
    }

    /// Index of the item containing the byte at `offset`, and that item's own offset
    fn locate(&self, offset: u64) -> Option<(usize, u64)> {
        let mut start = 0;
        for (i, item) in self.items.iter().enumerate().rev() {
            if offset < start + item.width {
                return Some((i, start));
            }
            start += item.width;
        }
        None
    }

    /// Split the item at `idx` so that its top `upper` bytes become an item of their own. Both
    /// halves become opaque. Returns the index of the upper half.
    fn split(&mut self, idx: usize, upper: u64) -> usize {
        let w = self.items[idx].width;
        debug_assert!(upper > 0 && upper < w);
        self.items[idx] = StackItem::unknown(w - upper);
        self.items.insert(idx + 1, StackItem::unknown(upper));
        idx + 1
    }

    /// Restructure the stack so that exactly one item covers `[offset, offset+width)`, and return
    /// its index along with the item.
    pub fn find(&mut self, offset: u64, width: u64) -> Option<(usize, &StackItem)> {
        let end = offset.checked_add(width);
        if self.mangled || width == 0 || end.map_or(true, |end| end > self.total_width()) {
            return None;
        }
        let (mut idx, start) = self.locate(offset)?;
        if start < offset {
            // Keep the bytes below `offset` in place, the target starts at the lower half
            self.split(idx, offset - start);
        }
        if self.items[idx].width < width {
            let mut covered = self.items[idx].width;
            while covered < width {
                // Total width was checked above, so there is always an item below
                let below = self.items.remove(idx - 1);
                covered += below.width;
                idx -= 1;
            }
            self.items[idx] = StackItem::unknown(covered);
        }
        if self.items[idx].width > width {
            idx = self.split(idx, width);
        }
        let item = &self.items[idx];
        debug_assert_eq!(item.width, width);
        Some((idx, item))
    }

    /// The item covering exactly `[offset, offset+width)`
    pub fn get(&mut self, offset: u64, width: u64) -> Option<&StackItem> {
        self.find(offset, width).map(|(_, i)| i)
    }

    /// Overwrite `[offset, offset+item.width)` with `item`. If that range cannot be isolated the
    /// stack is mangled.
    pub fn put(&mut self, offset: u64, item: StackItem) {
        match self.find(offset, item.width).map(|(idx, _)| idx) {
            Some(idx) => self.items[idx] = item,
            None => self.mangle(),
        }
    }

    /// For a back reference stored at `offset`, the current offset of the location it refers
    /// to.
    pub fn resolve(&mut self, offset: u64) -> Option<u64> {
        let item = self.get(offset, 2)?;
        match item.content {
            Content::BackReference(d) => {
                let base = offset.checked_add(item.width)?;
                let target = i64::try_from(base).ok()?.checked_add(d)?;
                u64::try_from(target).ok()
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for SymbolicStack {
    /// Top first, e.g. `{#3|&fp-8|?4}`
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.mangled {
            return write!(f, "{{mangled}}");
        }
        write!(f, "{{")?;
        for (i, item) in self.items.iter().rev().enumerate() {
            write!(f, "{}{}", if i == 0 { "" } else { "|" }, item)?;
        }
        write!(f, "}}")
    }
}
