use clap::Parser;

use crate::sys::NodeID;

#[derive(Parser, Debug)]
pub struct CmdArgs {
    /// id of this node in files/node_config.yaml
    pub this_id: NodeID,
    /// dir holding files/node_config.yaml
    pub files_dir: String,
}
