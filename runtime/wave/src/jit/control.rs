//! Structured control-flow bookkeeping for the single-pass translator.

use crate::WasmType;

use super::x86_64::CodeBuffer;
use super::JitError;

/// A location in the code buffer waiting for a branch target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchSite {
    /// rel32 displacement of a jump, relative to the end of the field.
    Rel32(u32),
    /// Absolute 64-bit address inside an inline branch table.
    Abs64(u32),
}

impl PatchSite {
    /// Point this site at buffer position `target`.
    pub fn apply(self, buf: &mut CodeBuffer, target: u32) -> Result<(), JitError> {
        match self {
            Self::Rel32(at) => buf.patch_rel32(at, target),
            Self::Abs64(at) => {
                buf.patch_abs64(at, target);
                Ok(())
            }
        }
    }
}

/// Where a branch to a label lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchTarget {
    /// Backward target: the loop header.
    Resolved(u32),
    /// Forward target: sites patched at the matching `end`.
    Pending(Vec<PatchSite>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Function,
    Block,
    Loop,
    If,
}

#[derive(Debug)]
pub struct ControlFrame {
    pub kind: BlockKind,
    /// Block result type.
    pub result: Option<WasmType>,
    pub target: BranchTarget,
    /// The `jz` of an `if` whose else-arm has not started yet.
    pub else_site: Option<u32>,
}

impl ControlFrame {
    pub fn new(kind: BlockKind, result: Option<WasmType>, position: u32) -> Self {
        let target = match kind {
            BlockKind::Loop => BranchTarget::Resolved(position),
            _ => BranchTarget::Pending(Vec::new()),
        };
        Self {
            kind,
            result,
            target,
            else_site: None,
        }
    }

    /// Whether a branch to this label carries a value. Loop labels never do.
    pub fn carries_value(&self) -> bool {
        self.kind != BlockKind::Loop && self.result.is_some()
    }

    /// Record a forward site; backward targets need none.
    pub fn add_site(&mut self, site: PatchSite) {
        if let BranchTarget::Pending(sites) = &mut self.target {
            sites.push(site);
        }
    }

    /// Patch every pending site (and a dangling else jump) to `here`.
    pub fn resolve(self, buf: &mut CodeBuffer, here: u32) -> Result<(), JitError> {
        if let BranchTarget::Pending(sites) = self.target {
            for site in sites {
                site.apply(buf, here)?;
            }
        }
        if let Some(site) = self.else_site {
            buf.patch_rel32(site, here)?;
        }
        Ok(())
    }
}

/// Stack of open blocks, innermost last.
#[derive(Debug, Default)]
pub struct ControlStack {
    frames: Vec<ControlFrame>,
}

impl ControlStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn push(&mut self, frame: ControlFrame) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) -> Result<ControlFrame, JitError> {
        self.frames
            .pop()
            .ok_or_else(|| JitError::InvalidBytecode("unbalanced end".into()))
    }

    pub fn innermost_mut(&mut self) -> Result<&mut ControlFrame, JitError> {
        self.frames
            .last_mut()
            .ok_or_else(|| JitError::InvalidBytecode("no enclosing block".into()))
    }

    /// The frame `depth` labels out from the innermost one.
    pub fn label_mut(&mut self, depth: u32) -> Result<&mut ControlFrame, JitError> {
        let len = self.frames.len();
        let depth = depth as usize;
        if depth >= len {
            return Err(JitError::InvalidBytecode(format!(
                "branch depth {} with {} open blocks",
                depth, len
            )));
        }
        Ok(&mut self.frames[len - 1 - depth])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_labels_are_resolved_and_carry_nothing() {
        let frame = ControlFrame::new(BlockKind::Loop, Some(WasmType::I32), 40);
        assert_eq!(frame.target, BranchTarget::Resolved(40));
        assert!(!frame.carries_value());

        let frame = ControlFrame::new(BlockKind::Block, Some(WasmType::I32), 40);
        assert!(frame.carries_value());
        assert_eq!(frame.target, BranchTarget::Pending(Vec::new()));
    }

    #[test]
    fn test_label_depths() {
        let mut stack = ControlStack::new();
        stack.push(ControlFrame::new(BlockKind::Function, None, 0));
        stack.push(ControlFrame::new(BlockKind::Block, None, 4));
        stack.push(ControlFrame::new(BlockKind::Loop, None, 8));

        assert_eq!(stack.label_mut(0).unwrap().kind, BlockKind::Loop);
        assert_eq!(stack.label_mut(2).unwrap().kind, BlockKind::Function);
        assert!(stack.label_mut(3).is_err());
    }

    #[test]
    fn test_resolve_patches_forward_sites() {
        let mut buf = CodeBuffer::new(0x4000);
        buf.emit_u8(0xE9);
        let jump = buf.position();
        buf.emit_u32(0);
        let table = buf.position();
        buf.emit_u64(0);
        buf.emit_u8(0xC3);

        let mut frame = ControlFrame::new(BlockKind::Block, None, 0);
        frame.add_site(PatchSite::Rel32(jump));
        frame.add_site(PatchSite::Abs64(table));
        let here = buf.position();
        frame.resolve(&mut buf, here).unwrap();

        let code = buf.finish().unwrap();
        assert_eq!(&code[1..5], &(here as i32 - 5).to_le_bytes());
        assert_eq!(&code[5..13], &(0x4000u64 + u64::from(here)).to_le_bytes());
    }

    #[test]
    fn test_unbalanced_pop_is_an_error() {
        let mut stack = ControlStack::new();
        assert!(stack.pop().is_err());
    }
}
