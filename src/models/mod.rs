pub mod anthropic;
pub mod antigravity;
