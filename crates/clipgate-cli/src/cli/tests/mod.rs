//! CLI parse tests.

use super::*;

mod rest;

pub(super) fn parse(args: &[&str]) -> CliCommand {
    Cli::try_parse_from(args).unwrap().command
}
