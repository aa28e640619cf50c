pub mod days;
pub mod machine;
pub mod model;
pub mod occurrence;
pub mod registry;
pub mod scheduler;
