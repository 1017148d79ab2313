use std::{env, net::IpAddr, path::PathBuf, time::Duration};

use devjob_lib::PoolConfig;
use rocket::Config;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "devjob-server", about = "Runs repository jobs against attached devices")]
pub struct Opt {
    /// directory holding one subdirectory per job, defaults to $HOME/jobs
    #[structopt(long, env = "JOBS_PATH", parse(from_os_str))]
    pub jobs_path: Option<PathBuf>,
    /// script run from the checked out repo when a job brings no inline script
    #[structopt(long, default_value = ".init.sh")]
    pub init_script: String,
    /// env key selecting the device a job runs against
    #[structopt(long, default_value = "ANDROID_SERIAL")]
    pub device_key: String,
    #[structopt(long, default_value = "5")]
    pub heartbeat_secs: u64,
    /// do not answer ssh host key and password prompts
    #[structopt(long)]
    pub no_interactive: bool,
    #[structopt(long, default_value = "127.0.0.1")]
    pub address: IpAddr,
    #[structopt(long, default_value = "8000")]
    pub port: u16,
}

impl Opt {
    pub fn jobs_root(&self) -> PathBuf {
        match &self.jobs_path {
            Some(path) => path.clone(),
            None => env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_default()
                .join("jobs"),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        let mut config = PoolConfig::new(self.jobs_root());
        config.init_script = self.init_script.clone();
        config.device_key = self.device_key.clone();
        config.heartbeat = Duration::from_secs(self.heartbeat_secs.max(1));
        config.interactive = !self.no_interactive;
        config
    }

    pub fn rocket_config(&self) -> Config {
        Config {
            address: self.address,
            port: self.port,
            ..Config::default()
        }
    }
}
