pub mod claude;
pub mod openai;
pub mod upstream;
