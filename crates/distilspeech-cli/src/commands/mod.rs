pub mod checkpoints;
pub mod filter;
pub mod init_student;
pub mod train;
