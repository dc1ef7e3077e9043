use anyhow::{Context, Result};
use fixkit_image::scanner::Pattern;

/// How a fix changes the code it finds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixKind {
    /// Mid hook at an instruction boundary
    Hook,
    /// Bytes overwritten in place, possibly inside an instruction
    Patch,
}

/// A code signature in the game executable. `|` marks where the fix applies, relative to
/// the start of the match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub name: &'static str,
    pub kind: FixKind,
    pub pattern: &'static str,
}

impl Signature {
    pub fn pattern(&self) -> Result<Pattern> {
        Pattern::new(self.pattern).with_context(|| format!("bad signature for {}", self.name))
    }
}

/// Where the swapchain resolution lands in rsi (width) and rbx (height)
pub const RESOLUTION: Signature = Signature {
    name: "Resolution",
    kind: FixKind::Hook,
    pattern: "45 0F ?? ?? | 8B ?? 8B ?? 48 8B ?? ?? ?? 48 8B ?? ?? ?? 48 8B ?? ?? ?? 48 83 ?? ?? 41 ?? E9 ?? ?? ?? ??",
};

/// Camera aspect ratio is taken from xmm8, the real one is in xmm5
pub const ASPECT_RATIO: Signature = Signature {
    name: "Aspect Ratio",
    kind: FixKind::Hook,
    pattern: "0F 28 ?? F3 ?? ?? ?? ?? F3 ?? ?? ?? ?? F3 0F ?? ?? 0F 57 ?? F3 0F ?? ?? 0F ?? ?? F3 ?? ?? ?? ??",
};

/// Immediate of `mov byte ptr [reg+disp8],1` enabling the UI plate polygon
pub const PILLARBOXING: Signature = Signature {
    name: "Pillarboxing",
    kind: FixKind::Patch,
    pattern: "C6 ?? ?? | 01 E8 ?? ?? ?? ?? 48 8B ?? 48 8B ?? 48 83 ?? ?? ?? 48 FF ?? ??",
};

/// Frame rate limit is passed on in rcx
pub const FRAMERATE_LIMIT: Signature = Signature {
    name: "Framerate Limit",
    kind: FixKind::Hook,
    pattern: "0F ?? ?? 89 ?? ?? ?? ?? ?? E8 ?? ?? ?? ?? 88 ?? ?? ?? ?? ?? 48 83 ?? ?? ?? C3",
};

pub const ALL: [Signature; 4] = [RESOLUTION, ASPECT_RATIO, PILLARBOXING, FRAMERATE_LIMIT];
