// Process-wide resources, constructed once at startup

pub mod deps;

pub use deps::SchedulerDeps;
