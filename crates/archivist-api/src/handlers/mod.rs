pub mod admin;
pub mod archive;
pub mod health;
pub mod jobs;
pub mod objects;
