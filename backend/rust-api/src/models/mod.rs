pub mod assignment;
pub mod attempt;
pub mod audit_log;
pub mod game;
pub mod play;
pub mod signin_token;
