pub mod approval;
pub mod context;
pub mod decision;
