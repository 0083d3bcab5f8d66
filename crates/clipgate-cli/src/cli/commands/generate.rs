//! `clipgate completions <shell>` and `clipgate manpage`.

use anyhow::Result;
use clap::Command;
use clap_complete::Shell;

pub fn run_completions(mut cmd: Command, shell: Shell) -> Result<()> {
    let name = cmd.get_name().to_string();
    clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
    Ok(())
}

pub fn run_manpage(cmd: Command) -> Result<()> {
    clap_mangen::Man::new(cmd).render(&mut std::io::stdout())?;
    Ok(())
}
