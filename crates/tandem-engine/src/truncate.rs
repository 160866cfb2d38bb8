//! Size caps applied to tool output before it enters the session log.

use std::borrow::Cow;

/// Byte budget for one tool result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputCap(pub usize);

impl OutputCap {
    pub const DEFAULT: Self = Self(256 * 1024);
    /// Shell output is noisy; allow more of it.
    pub const SHELL: Self = Self(1024 * 1024);

    pub fn for_tool(name: &str) -> Self {
        match name {
            "bash" => Self::SHELL,
            _ => Self::DEFAULT,
        }
    }

    /// Keep at most the cap's bytes, cut on a char boundary, followed by a
    /// `[truncated: X bytes -> Y bytes]` marker. Borrows when nothing is cut.
    pub fn apply<'a>(&self, output: &'a str) -> Cow<'a, str> {
        if output.len() <= self.0 {
            return Cow::Borrowed(output);
        }
        let kept = (0..=self.0)
            .rev()
            .find(|&i| output.is_char_boundary(i))
            .unwrap_or(0);
        Cow::Owned(format!(
            "{}\n\n[truncated: {} bytes -> {} bytes]",
            &output[..kept],
            output.len(),
            kept
        ))
    }
}

/// First `max_chars` characters, for event previews.
pub fn preview(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
