pub mod access;
pub mod context;
pub mod membership;
pub mod organisation;
pub mod project;
pub mod user;
