pub mod dispatcher;
pub mod generation;
pub mod prompt;
