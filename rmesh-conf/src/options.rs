use structopt::StructOpt;

/// Command line options, applied on top of the configuration files.
#[derive(StructOpt, Debug, Clone, Default)]
#[structopt(name = "rmeshd")]
pub struct Options {
    /// Config filename
    #[structopt(name = "config", short = "f", long)]
    pub cfg_name: Option<String>,

    /// Client listen address, e.g. ":8080"
    #[structopt(name = "listen", long)]
    pub listen: Option<String>,

    /// Cluster listen address, e.g. ":4000"
    #[structopt(name = "cluster-listen", long)]
    pub cluster_listen: Option<String>,

    /// Address of any cluster member to join through
    #[structopt(name = "cluster-seed", long)]
    pub cluster_seed: Option<String>,

    /// License string
    #[structopt(name = "license", long)]
    pub license: Option<String>,
}
