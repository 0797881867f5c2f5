pub mod instance;
pub mod resolver;
pub mod runtime;
pub mod stack;
