// IPC module - Alarm/command messaging between master and workers

pub mod channel;
pub mod protocol;

pub use channel::{AlarmChannel, AlarmReceiver, AlarmSender, CHANNEL_FD_ENV};
pub use protocol::AlarmMessage;
