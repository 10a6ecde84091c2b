//! Commands the dialogue synthesizes on open when their names are configured.

use crate::command::Command;
use crate::error::Closed;
use crate::flags::{ArghArgs, ArghFlags};
use crate::io_adapters::Output;
use argh::FromArgs;
use std::io::Write;

#[derive(FromArgs)]
/// Output the help prompt for all commands, or for one command with -n.
struct HelpArgs {
    #[argh(option, short = 'n')]
    /// name of the command to describe in detail.
    name: Option<String>,

    #[argh(positional, greedy)]
    /// ignored.
    rest: Vec<String>,
}

impl ArghArgs for HelpArgs {
    fn positionals(&self) -> &[String] {
        &self.rest
    }
}

/// `<name> [-n <command-name>]`: writes `render("")` or `render(command-name)`.
pub(crate) fn help<F>(name: &str, render: F, output: Output) -> Command
where
    F: Fn(&str) -> String + Send + Sync + 'static,
{
    let (flags, value) = ArghFlags::<HelpArgs>::new();

    Command::new(name)
        .structure(format!("{name} [-n <command-name>]"))
        .help_short("outputs the help prompt for all commands or a specified command via the -n flag")
        .help_long(format!(
            "{name} formats a short version of help prompts for all available commands when run without \
             the -n flag.\nOptionally provide -n to get the detailed help prompt of the command named after it."
        ))
        .flags(flags)
        .exec(move |_, _| {
            let target = value
                .with(|args| args.and_then(|a| a.name.clone()))
                .unwrap_or_default();
            let mut out = output.clone();
            out.write_all(render(&target).as_bytes())?;
            out.flush()?;
            Ok(())
        })
}

/// `<name>`: ends the dialogue as if it had been closed.
pub(crate) fn quit(name: &str) -> Command {
    Command::new(name)
        .help_short("quits the dialogue abruptly")
        .exec(|_, _| Err(Closed.into()))
}
