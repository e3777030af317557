pub mod encoder;
pub mod lower;
pub mod minst;
pub mod patch;
pub mod regs;
