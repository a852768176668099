/// How streamed text fragments are folded into the running response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Fragments may repeat text already received; overlap is suppressed.
    Deduplicate,
    /// Fragments are clean deltas and are appended verbatim.
    Append,
}

/// Running response text for one turn.
#[derive(Debug, Clone)]
pub struct TextMerger {
    mode: MergeMode,
    text: String,
}

impl TextMerger {
    pub fn new(mode: MergeMode) -> Self {
        Self {
            mode,
            text: String::new(),
        }
    }

    pub fn mode(&self) -> MergeMode {
        self.mode
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }

    /// Folds `fragment` in and returns the part that is new, if any.
    pub fn push(&mut self, fragment: &str) -> Option<String> {
        if fragment.is_empty() {
            return None;
        }
        let new = match self.mode {
            MergeMode::Append => fragment,
            MergeMode::Deduplicate => novel_suffix(&self.text, fragment),
        };
        if new.is_empty() {
            return None;
        }
        self.text.push_str(new);
        Some(new.to_string())
    }
}

/// The part of `fragment` not already covered by the end of `current`.
fn novel_suffix<'a>(current: &str, fragment: &'a str) -> &'a str {
    if current.is_empty() {
        return fragment;
    }
    if fragment == current {
        return "";
    }
    if let Some(rest) = fragment.strip_prefix(current) {
        return rest;
    }

    let max = current.len().min(fragment.len());
    for len in (1..=max).rev() {
        let start = current.len() - len;
        if !current.is_char_boundary(start) || !fragment.is_char_boundary(len) {
            continue;
        }
        if current[start..] == fragment[..len] {
            return &fragment[len..];
        }
    }
    fragment
}
