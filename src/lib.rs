pub mod banning;
pub mod bus;
pub mod clock;
pub mod config;
pub mod daemon;
pub mod jobs;
pub mod metrics;
pub mod pool;
pub mod relay;
pub mod shares;
pub mod stratum;
pub mod util;
pub mod vardiff;
