pub mod attendance;
pub mod auth;
pub mod classes;
pub mod core;
pub mod grades;
pub mod notifications;
pub mod reports;
pub mod roster;
pub mod students;
pub mod users;
