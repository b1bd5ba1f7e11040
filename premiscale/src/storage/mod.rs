pub mod state;
pub mod timeseries;
