use crate::chain::{CallChain, Link};
use crate::error::RegistrationError;
use crate::flags::{FlagError, Flags};
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::sync::Arc;

/// Handler run when a command is reached in a [`CallChain`].
///
/// It receives the chain (already advanced so that this command is the head) and
/// the command's residual arguments. Handlers decide whether to continue up the
/// chain via [`CallChain::advance_exec`].
pub type Exec = Arc<dyn Fn(&mut CallChain, &[String]) -> anyhow::Result<()> + Send + Sync>;

/// Renders help for a command; `focus` asks for the detailed version.
pub type FormatHelp = Arc<dyn Fn(&Command, bool) -> String + Send + Sync>;

/// A named, executable node in a command tree.
///
/// Commands are assembled with the builder methods and then shared as
/// `Arc<Command>`; the same sub-command may hang under several parents.
pub struct Command {
    name: String,
    structure: Option<String>,
    help_short: String,
    help_long: Option<String>,
    format_help: Option<FormatHelp>,
    flags: Option<Mutex<Box<dyn Flags>>>,
    subcommands: Vec<Arc<Command>>,
    exec: Option<Exec>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            structure: None,
            help_short: String::new(),
            help_long: None,
            format_help: None,
            flags: None,
            subcommands: Vec::new(),
            exec: None,
        }
    }

    /// Synopsis shown in place of the name in help output, e.g. `echo [-n N] <args>`.
    pub fn structure(mut self, structure: impl Into<String>) -> Self {
        self.structure = Some(structure.into());
        self
    }

    pub fn help_short(mut self, text: impl Into<String>) -> Self {
        self.help_short = text.into();
        self
    }

    pub fn help_long(mut self, text: impl Into<String>) -> Self {
        self.help_long = Some(text.into());
        self
    }

    pub fn flags(mut self, flags: impl Flags + 'static) -> Self {
        self.flags = Some(Mutex::new(Box::new(flags)));
        self
    }

    pub fn subcommand(mut self, command: impl Into<Arc<Command>>) -> Self {
        self.subcommands.push(command.into());
        self
    }

    pub fn exec<F>(mut self, exec: F) -> Self
    where
        F: Fn(&mut CallChain, &[String]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.exec = Some(Arc::new(exec));
        self
    }

    /// Replace the default help formatter for this command.
    pub fn format_help_with<F>(mut self, format: F) -> Self
    where
        F: Fn(&Command, bool) -> String + Send + Sync + 'static,
    {
        self.format_help = Some(Arc::new(format));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn structure_text(&self) -> Option<&str> {
        self.structure.as_deref()
    }

    pub fn short_help(&self) -> &str {
        &self.help_short
    }

    pub fn long_help(&self) -> Option<&str> {
        self.help_long.as_deref()
    }

    pub fn subcommands(&self) -> &[Arc<Command>] {
        &self.subcommands
    }

    /// Render help through the custom formatter, or the default one.
    pub fn format_help(&self, focus: bool) -> String {
        match &self.format_help {
            Some(format) => format(self, focus),
            None => default_help(self, focus),
        }
    }

    /// Usage text from the flag collaborator, if it provides one.
    pub fn flag_usage(&self) -> Option<String> {
        self.flags.as_ref()?.lock().usage(&self.name)
    }

    /// Check that this command and every sub-command can be dispatched.
    pub fn validate(&self) -> Result<(), RegistrationError> {
        if self.name.is_empty() {
            return Err(RegistrationError::NoName);
        }
        if self.exec.is_none() {
            return Err(RegistrationError::NoExec(self.name.clone()));
        }
        for (i, sub) in self.subcommands.iter().enumerate() {
            if self.subcommands[..i].iter().any(|prev| names_match(&prev.name, &sub.name)) {
                return Err(RegistrationError::DuplicateSubcommand {
                    parent: self.name.clone(),
                    name: sub.name.clone(),
                });
            }
        }
        self.subcommands.iter().try_for_each(|sub| sub.validate())
    }

    pub(crate) fn executor(&self) -> Option<Exec> {
        self.exec.clone()
    }

    pub(crate) fn reset_flags(&self) {
        if let Some(flags) = &self.flags {
            flags.lock().reset();
        }
    }

    /// Resolve `args` into a leaf-first call chain rooted at this command.
    ///
    /// The first positional token naming any sub-command (case-insensitively)
    /// splits the arguments: tokens before it stay with this command, tokens after
    /// it are parsed by the sub-command.
    ///
    /// A leading `-h` or `--help`, or a help request from the flags, fails with
    /// [`FlagError::Help`] carrying this command's focused help.
    pub(crate) fn parse(self: &Arc<Self>, args: &[String]) -> Result<CallChain, FlagError> {
        if matches!(args.first().map(String::as_str), Some("-h" | "--help")) {
            return Err(FlagError::Help(self.format_help(true)));
        }

        let positionals = match &self.flags {
            Some(flags) => {
                // The lock must be released before rendering help, which reads the flags.
                let parsed = {
                    let mut flags = flags.lock();
                    flags
                        .parse(&self.name, args)
                        .map(|()| flags.positionals().to_vec())
                };
                parsed.map_err(|err| match err {
                    FlagError::Help(_) => FlagError::Help(self.format_help(true)),
                    invalid => invalid,
                })?
            }
            None => args.to_vec(),
        };

        let found = positionals.iter().enumerate().find_map(|(i, token)| {
            self.subcommands
                .iter()
                .find(|sub| names_match(&sub.name, token))
                .map(|sub| (i, sub))
        });

        match found {
            Some((i, sub)) => match sub.parse(&positionals[i + 1..]) {
                Ok(mut chain) => {
                    chain.push_root(Link::new(Arc::clone(self), positionals[..i].to_vec()));
                    Ok(chain)
                }
                Err(err) => {
                    // No chain will exist to clean up after, so undo our own flags here.
                    self.reset_flags();
                    Err(err)
                }
            },
            None => Ok(CallChain::new(Link::new(Arc::clone(self), positionals))),
        }
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("subcommands", &self.subcommands)
            .finish_non_exhaustive()
    }
}

fn names_match(a: &str, b: &str) -> bool {
    a.chars()
        .flat_map(char::to_lowercase)
        .eq(b.chars().flat_map(char::to_lowercase))
}

fn display_name(command: &Command) -> &str {
    command.structure.as_deref().unwrap_or(&command.name)
}

fn default_help(command: &Command, focus: bool) -> String {
    if !focus {
        return format!("{}\t{}\n", display_name(command), command.help_short);
    }

    let mut out = String::new();
    out.push_str(display_name(command));
    out.push_str("\n\n");

    if let Some(long) = &command.help_long {
        out.push_str(long);
        out.push_str("\n\n");
    }

    if let Some(usage) = command.flag_usage() {
        out.push_str("FLAGS\n");
        out.push_str(usage.trim_end());
        out.push_str("\n\n");
    }

    if !command.subcommands.is_empty() {
        out.push_str("SUBCOMMANDS\n");
        let width = command
            .subcommands
            .iter()
            .map(|sub| display_name(sub).len())
            .max()
            .unwrap_or(0);
        for sub in &command.subcommands {
            let _ = writeln!(out, "{:<width$}  {}", display_name(sub), sub.help_short);
        }
        out.push('\n');
    }

    format!("{}\n", out.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::{ArghArgs, ArghFlags};
    use argh::FromArgs;

    fn cmd(name: &str) -> Command {
        Command::new(name).exec(|_, _| Ok(()))
    }

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    fn names(chain: &CallChain) -> Vec<&str> {
        chain.iter().map(|link| link.command().name()).collect()
    }

    #[test]
    fn test_parse_builds_leaf_first_chain() {
        let cmd5 = Arc::new(cmd("cmd5"));
        let cmd4 = Arc::new(cmd("cmd4").subcommand(Arc::clone(&cmd5)));
        let cmd3 = Arc::new(
            cmd("cmd3")
                .subcommand(Arc::clone(&cmd4))
                .subcommand(Arc::clone(&cmd5)),
        );
        let cmd2 = Arc::new(cmd("cmd2").subcommand(Arc::clone(&cmd3)));
        let cmd1 = Arc::new(
            cmd("cmd1")
                .subcommand(Arc::clone(&cmd2))
                .subcommand(Arc::clone(&cmd3))
                .subcommand(Arc::clone(&cmd4)),
        );

        let cases: Vec<(&Arc<Command>, Vec<&str>, Vec<&str>)> = vec![
            (&cmd1, vec!["not", "existing"], vec!["cmd1"]),
            (&cmd1, vec!["cmd2", "cmd3", "cmd5"], vec!["cmd5", "cmd3", "cmd2", "cmd1"]),
            (&cmd2, vec!["cmd3", "cmd4"], vec!["cmd4", "cmd3", "cmd2"]),
            (&cmd2, vec!["cmd1"], vec!["cmd2"]),
            (&cmd3, vec!["cmd3"], vec!["cmd3"]),
            (&cmd4, vec!["CMD5"], vec!["cmd5", "cmd4"]),
        ];

        for (root, args, expected) in cases {
            let chain = root.parse(&strings(&args)).unwrap();
            assert_eq!(names(&chain), expected, "args {args:?}");
        }
    }

    #[test]
    fn test_parse_splits_residual_arguments() {
        let leaf = Arc::new(cmd("leaf"));
        let root = Arc::new(cmd("root").subcommand(Arc::clone(&leaf)));

        let chain = root.parse(&strings(&["a", "b", "leaf", "c", "d"])).unwrap();
        let args: Vec<&[String]> = chain.iter().map(|link| link.args()).collect();
        assert_eq!(args, [strings(&["c", "d"]), strings(&["a", "b"])]);
    }

    #[test]
    fn test_parse_matches_first_token_naming_any_child() {
        let alpha = Arc::new(cmd("alpha"));
        let beta = Arc::new(cmd("beta"));
        let root = Arc::new(
            cmd("root")
                .subcommand(Arc::clone(&alpha))
                .subcommand(Arc::clone(&beta)),
        );

        // beta appears first in the input, so it wins even though alpha is declared first.
        let chain = root.parse(&strings(&["x", "beta", "alpha"])).unwrap();
        assert_eq!(names(&chain), ["beta", "root"]);
        assert_eq!(chain.current().args(), ["alpha"]);
    }

    #[derive(FromArgs)]
    /// test flags.
    struct Verbose {
        #[argh(switch, short = 'v')]
        /// be loud.
        verbose: bool,

        #[argh(positional, greedy)]
        /// rest.
        rest: Vec<String>,
    }

    impl ArghArgs for Verbose {
        fn positionals(&self) -> &[String] {
            &self.rest
        }
    }

    #[test]
    fn test_parse_consumes_flags_before_matching() {
        let (flags, value) = ArghFlags::<Verbose>::new();
        let leaf = Arc::new(cmd("leaf"));
        let root = Arc::new(cmd("root").flags(flags).subcommand(Arc::clone(&leaf)));

        let chain = root.parse(&strings(&["-v", "leaf", "x"])).unwrap();
        assert_eq!(names(&chain), ["leaf", "root"]);
        assert_eq!(value.with(|v| v.map(|v| v.verbose)), Some(true));

        chain.clean();
        let err = root.parse(&strings(&["--bogus"])).unwrap_err();
        assert!(matches!(err, FlagError::Invalid(_)));
    }

    #[test]
    fn test_failed_child_parse_resets_parent_flags() {
        let (root_flags, root_value) = ArghFlags::<Verbose>::new();
        let (leaf_flags, leaf_value) = ArghFlags::<Verbose>::new();
        let leaf = Arc::new(cmd("leaf").flags(leaf_flags));
        let root = Arc::new(cmd("root").flags(root_flags).subcommand(Arc::clone(&leaf)));

        let err = root.parse(&strings(&["-v", "leaf", "--nope"])).unwrap_err();
        assert!(matches!(err, FlagError::Invalid(_)));
        assert!(!root_value.is_set());
        assert!(!leaf_value.is_set());
    }

    #[test]
    fn test_validate_reports_missing_fields() {
        assert!(matches!(
            Command::new("").exec(|_, _| Ok(())).validate(),
            Err(RegistrationError::NoName)
        ));
        assert!(matches!(
            Command::new("x").validate(),
            Err(RegistrationError::NoExec(name)) if name == "x"
        ));
        assert!(matches!(
            cmd("root").subcommand(Command::new("child")).validate(),
            Err(RegistrationError::NoExec(name)) if name == "child"
        ));
        assert!(cmd("ok").subcommand(cmd("child")).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_siblings_differing_only_in_case() {
        let err = cmd("root")
            .subcommand(cmd("Go"))
            .subcommand(cmd("stop"))
            .subcommand(cmd("go"))
            .validate()
            .unwrap_err();
        assert_eq!(
            err,
            RegistrationError::DuplicateSubcommand {
                parent: "root".to_string(),
                name: "go".to_string(),
            }
        );

        // The same name under different parents is fine.
        let leaf = Arc::new(cmd("go"));
        assert!(
            cmd("root")
                .subcommand(cmd("a").subcommand(Arc::clone(&leaf)))
                .subcommand(cmd("b").subcommand(leaf))
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn test_help_request_renders_focused_help() {
        let plain = Arc::new(cmd("plain").help_long("plain has no flags"));
        let err = plain.parse(&strings(&["-h"])).unwrap_err();
        assert_eq!(err, FlagError::Help(plain.format_help(true)));
        assert!(err.to_string().contains("plain has no flags"));

        // A later -h is an ordinary argument for a command without flags.
        let chain = plain.parse(&strings(&["x", "-h"])).unwrap();
        assert_eq!(chain.current().args(), ["x", "-h"]);

        let (flags, value) = ArghFlags::<Verbose>::new();
        let flagged = Arc::new(cmd("flagged").flags(flags));
        let err = flagged.parse(&strings(&["-v", "--help"])).unwrap_err();
        let FlagError::Help(text) = err else {
            panic!("expected a help request");
        };
        assert!(text.starts_with("flagged\n"));
        assert!(text.contains("FLAGS"));
        assert!(!value.is_set());
    }

    #[test]
    fn test_default_help_formats() {
        let command = cmd("echo")
            .structure("echo [-n N] <args>")
            .help_short("repeat the args")
            .help_long("echo writes its arguments back")
            .subcommand(cmd("loud").help_short("shout"))
            .subcommand(cmd("whisper").help_short("murmur"));

        assert_eq!(command.format_help(false), "echo [-n N] <args>\trepeat the args\n");
        assert_eq!(
            command.format_help(true),
            "echo [-n N] <args>\n\necho writes its arguments back\n\nSUBCOMMANDS\nloud     shout\nwhisper  murmur\n"
        );
    }

    #[test]
    fn test_custom_help_formatter() {
        let command = cmd("x").format_help_with(|c, focus| format!("{}:{focus}", c.name()));
        assert_eq!(command.format_help(true), "x:true");
        assert_eq!(command.format_help(false), "x:false");
    }
}
