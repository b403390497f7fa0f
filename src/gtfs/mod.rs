pub mod realtime;
pub mod static_data;
