use serde::Serialize;

/// One byte that differs between an original buffer and its glitched version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ByteDiff {
    pub offset: usize,
    pub original: u8,
    pub glitched: u8,
}

/// Byte-level comparison of an original buffer with a glitched one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GlitchDiff {
    pub original_len: usize,
    pub glitched_len: usize,
    /// Differing bytes over the common prefix; length changes show up in the sizes only.
    pub differences: Vec<ByteDiff>,
}

impl GlitchDiff {
    pub fn size_delta(&self) -> i64 {
        self.glitched_len as i64 - self.original_len as i64
    }

    pub fn is_identical(&self) -> bool {
        self.original_len == self.glitched_len && self.differences.is_empty()
    }
}

pub fn analyze(original: &[u8], glitched: &[u8]) -> GlitchDiff {
    let differences = original
        .iter()
        .zip(glitched)
        .enumerate()
        .filter(|(_, (a, b))| a != b)
        .map(|(offset, (&original, &glitched))| ByteDiff {
            offset,
            original,
            glitched,
        })
        .collect();

    GlitchDiff {
        original_len: original.len(),
        glitched_len: glitched.len(),
        differences,
    }
}
