//! Command-line front end

pub mod commands;

pub use commands::{
    cmd_config, cmd_mine, cmd_simulate, node_names, parse_transfer, CliResult, SimulateOptions,
    TransferSpec,
};
