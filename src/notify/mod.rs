pub mod mailer;
pub mod scheduler;
pub mod sweep;
pub mod tasks;
pub mod templates;
