//! The GameCube audio DSP: register file, memories, static analysis and the reference
//! interpreter. The block translator lives in the `jit` crate.

pub mod analyzer;
pub mod context;
pub mod error;
pub mod hw;
pub mod interpreter;
pub mod memory;
pub mod opcodes;
pub mod regs;

pub use context::{DspContext, DspSignals};
pub use error::DspError;

/// Decodes a raw big endian microcode image into instruction words
pub fn parse_image(bytes: &[u8]) -> Result<Vec<u16>, DspError> {
    if bytes.len() % 2 != 0 {
        return Err(DspError::OddImage(bytes.len()));
    }
    let words: Vec<u16> = bytes.chunks_exact(2).map(|w| u16::from_be_bytes([w[0], w[1]])).collect();
    if words.len() > memory::IRAM_SIZE {
        return Err(DspError::ImageTooLarge { words: words.len(), capacity: memory::IRAM_SIZE });
    }
    Ok(words)
}

/// Loads a microcode image into IRAM at address 0
pub fn load_image(ctx: &mut DspContext, bytes: &[u8]) -> Result<(), DspError> {
    let words = parse_image(bytes)?;
    ctx.write_iram(0, &words);
    Ok(())
}
