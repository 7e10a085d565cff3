use thiserror::Error;

#[derive(Debug, Error)]
pub enum DspError {
    #[error("microcode image has an odd length of {0} bytes")]
    OddImage(usize),
    #[error("microcode image of {words} words does not fit in {capacity} words of IRAM")]
    ImageTooLarge { words: usize, capacity: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("cannot map memory for compiled code: {0}")]
    CodeMemory(#[from] std::io::Error),
    #[error("compiled code failed to assemble: {0}")]
    Assemble(String),
}
