pub mod assignments;
pub mod backup_exchange;
pub mod catalog;
pub mod core;
pub mod enrollments;
pub mod evaluations;
pub mod periods;
pub mod planning;
pub mod reports;
pub mod skills;
pub mod students;
pub mod subjects;
pub mod users;
