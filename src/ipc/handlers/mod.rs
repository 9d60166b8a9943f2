pub mod assessments;
pub mod core;
pub mod marks;
pub mod periods;
pub mod promotion;
pub mod results;
pub mod setup;
