pub mod anthropic;
pub mod openai;
pub mod router;
pub mod sse;
