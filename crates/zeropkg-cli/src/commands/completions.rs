use super::{CommandResult, EXIT_SUCCESS};
use clap::CommandFactory;
use clap_complete::Shell;

#[allow(clippy::unnecessary_wraps)]
pub fn run<C: CommandFactory>(shell: Shell) -> CommandResult {
    clap_complete::generate(shell, &mut C::command(), "zeropkg", &mut std::io::stdout());
    Ok(EXIT_SUCCESS)
}
