use argh::FromArgs;
use crossbeam_channel::{after, select};
use line_dialogue::{
    ArghArgs, ArghFlags, CallChain, CancelToken, Command, Config, Dialogue, Output, SessionError,
};
use regex::RegexBuilder;
use std::io::{self, Write};
use std::thread;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(FromArgs)]
/// Echo-style interactive dialogue reading commands from stdin.
struct Cli {
    #[argh(option, default = "String::from(\"(echo) \")")]
    /// prompt written before every line.
    prefix: String,

    #[argh(option, default = "5000")]
    /// how long Ctrl-C waits for the current command before forcing a close.
    shutdown_timeout_ms: u64,
}

#[derive(FromArgs)]
/// Repeat the arguments.
struct EchoArgs {
    #[argh(option, short = 'n', default = "1")]
    /// number of times to repeat.
    n: usize,

    #[argh(positional, greedy)]
    /// words to echo.
    words: Vec<String>,
}

impl ArghArgs for EchoArgs {
    fn positionals(&self) -> &[String] {
        &self.words
    }
}

#[derive(FromArgs)]
/// Print the words matching a pattern.
struct GrepArgs {
    #[argh(switch, short = 'i')]
    /// match case-insensitively.
    ignore_case: bool,

    #[argh(positional, greedy)]
    /// pattern followed by the words to filter.
    rest: Vec<String>,
}

impl ArghArgs for GrepArgs {
    fn positionals(&self) -> &[String] {
        &self.rest
    }
}

fn echo(output: Output) -> Command {
    let (flags, value) = ArghFlags::<EchoArgs>::new();

    Command::new("echo")
        .structure("echo [-n N] <args>")
        .help_short("writes its arguments back, N times")
        .help_long("echo joins its arguments with single spaces and writes them on one line.")
        .flags(flags)
        .exec(move |_, args| {
            let times = value.with(|v| v.map_or(1, |v| v.n));
            let mut out = output.clone();
            for _ in 0..times {
                writeln!(out, "{}", args.join(" "))?;
            }
            Ok(())
        })
}

fn grep(output: Output) -> Command {
    let (flags, value) = ArghFlags::<GrepArgs>::new();

    Command::new("grep")
        .structure("grep [-i] <pattern> <words..>")
        .help_short("prints the words matching a regular expression")
        .flags(flags)
        .exec(move |_, args| {
            let mut out = output.clone();
            let Some((pattern, words)) = args.split_first() else {
                writeln!(out, "grep: missing pattern")?;
                return Ok(());
            };

            let ignore_case = value.with(|v| v.is_some_and(|v| v.ignore_case));
            let re = match RegexBuilder::new(pattern).case_insensitive(ignore_case).build() {
                Ok(re) => re,
                Err(err) => {
                    writeln!(out, "grep: {err}")?;
                    return Ok(());
                }
            };

            for word in words.iter().filter(|w| re.is_match(w)) {
                writeln!(out, "{word}")?;
            }
            Ok(())
        })
}

fn say(output: Output) -> Command {
    Command::new("say")
        .structure("say <words>")
        .help_short("prints its words once the enclosing wait is over")
        .exec(move |chain: &mut CallChain, args| {
            if chain.next(None).is_some() {
                let token = chain.current().token();
                chain.advance_exec(1, Some(token))?;
            }
            writeln!(output.clone(), "{}", args.join(" "))?;
            Ok(())
        })
}

fn wait(output: Output) -> Command {
    Command::new("wait")
        .structure("wait <ms>")
        .help_short("sleeps for the given number of milliseconds")
        .help_long("wait sleeps, giving up early if the dialogue is closed.")
        .subcommand(say(output.clone()))
        .exec(move |chain, args| {
            let mut out = output.clone();
            let Some(Ok(ms)) = args.first().map(|a| a.parse::<u64>()) else {
                writeln!(out, "wait: expected a duration in milliseconds")?;
                return Ok(());
            };

            let token = chain.current().token();
            select! {
                recv(token.done()) -> _ => writeln!(out, "wait: interrupted")?,
                recv(after(Duration::from_millis(ms))) -> _ => {}
            }
            Ok(())
        })
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli: Cli = argh::from_env();

    let dialogue = Dialogue::builder(io::stdin(), io::stdout())
        .config(Config::interactive(cli.prefix))
        .build()?;

    let output = dialogue.output();
    dialogue.register_commands([echo(output.clone()), grep(output.clone()), wait(output)])?;

    let handle = dialogue.clone();
    let grace = Duration::from_millis(cli.shutdown_timeout_ms);
    ctrlc::set_handler(move || {
        let dialogue = handle.clone();
        thread::spawn(move || {
            if let Err(err) = dialogue.shutdown(&CancelToken::new().timeout(grace)) {
                warn!(error = %err, "dialogue closed before the current command finished");
            }
        });
    })?;

    match dialogue.open() {
        Ok(()) | Err(SessionError::EndOfInput) => {
            writeln!(dialogue.output())?;
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}
