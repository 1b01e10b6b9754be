//! Progressive reveal of a completed reply, one prefix per tick.

/// Finite sequence of prefixes of a reply, from empty to the full text.
///
/// Steps are whole characters, so a reply of L chars yields exactly L + 1 prefixes.
/// Not `Clone`: once consumed a reveal cannot be restarted.
#[derive(Debug)]
pub struct Reveal {
    text: String,
    /// Byte offsets of each prefix end, in order: 0, then each char boundary, then len.
    next: Option<usize>,
}

impl Reveal {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            next: Some(0),
        }
    }
}

impl Iterator for Reveal {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let end = self.next?;
        let prefix = self.text[..end].to_string();
        self.next = self.text[end..]
            .chars()
            .next()
            .map(|c| end + c.len_utf8());
        Some(prefix)
    }
}

/// Holds at most one active reveal. Starting a new one drops the old one.
#[derive(Debug, Default)]
pub struct TypingRevealer {
    active: Option<Reveal>,
    shown: String,
}

impl TypingRevealer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin revealing `text` from an empty prefix, cancelling any reveal in progress.
    pub fn start(&mut self, text: impl Into<String>) {
        if self.active.is_some() {
            log::debug!("reveal: replacing reveal in progress");
        }
        self.active = Some(Reveal::new(text));
        self.shown.clear();
    }

    /// Stop revealing; the prefix shown so far is kept.
    pub fn cancel(&mut self) {
        self.active = None;
    }

    /// Drop the reveal and the shown text.
    pub fn clear(&mut self) {
        self.active = None;
        self.shown.clear();
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Text revealed so far.
    pub fn shown(&self) -> &str {
        &self.shown
    }

    /// Advance one step. Returns the new prefix, or `None` once the reveal has completed
    /// (at which point the revealer is inactive).
    pub fn tick(&mut self) -> Option<&str> {
        let reveal = self.active.as_mut()?;
        match reveal.next() {
            Some(prefix) => {
                self.shown = prefix;
                Some(&self.shown)
            }
            None => {
                self.active = None;
                None
            }
        }
    }
}
