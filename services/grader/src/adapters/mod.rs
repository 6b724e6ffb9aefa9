pub mod cpu;
pub mod db;
pub mod docker;

pub use cpu::HostMetrics;
pub use db::PgStore;
pub use docker::DockerRuntime;
