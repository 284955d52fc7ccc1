pub mod backbone;
pub mod resnet;
pub mod upernet;
pub mod with_tracing;
