pub mod asg;
pub mod domain;
pub mod host;
