use crate::cancel::CancelToken;
use crate::command::Command;
use anyhow::anyhow;
use std::sync::Arc;

/// One entry of a [`CallChain`]: a command plus the state bound to it for a
/// single dispatch.
#[derive(Debug)]
pub struct Link {
    command: Arc<Command>,
    args: Vec<String>,
    token: Option<CancelToken>,
}

impl Link {
    pub(crate) fn new(command: Arc<Command>, args: Vec<String>) -> Self {
        Self {
            command,
            args,
            token: None,
        }
    }

    pub fn command(&self) -> &Arc<Command> {
        &self.command
    }

    /// Residual positional arguments left for this command.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// The token bound when the chain reached this command, or a fresh root token.
    pub fn token(&self) -> CancelToken {
        self.token.clone().unwrap_or_default()
    }
}

/// Resolved execution path through a command tree.
///
/// It is ordered leaf-first: index 0 is the deepest matched sub-command and the
/// last entry is the root command that was typed. Advancing only ever moves
/// toward the root.
///
/// Dropping the chain resets the flags of every command it visited, so parsed
/// flags never outlive the dispatch, even when a handler panics.
#[derive(Debug)]
pub struct CallChain {
    links: Vec<Link>,
    head: usize,
}

impl CallChain {
    pub(crate) fn new(leaf: Link) -> Self {
        Self {
            links: vec![leaf],
            head: 0,
        }
    }

    pub(crate) fn push_root(&mut self, link: Link) {
        self.links.push(link);
    }

    /// Number of commands left, the current one included.
    pub fn len(&self) -> usize {
        self.links.len() - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Link> {
        self.links[self.head..].iter()
    }

    /// Drop the first `n` commands.
    ///
    /// # Panics
    ///
    /// Panics if `n >= self.len()`: a chain can never be advanced past its root.
    pub fn advance(&mut self, n: usize) {
        assert!(
            n < self.len(),
            "cannot advance call chain of length {} by {n}",
            self.len()
        );
        self.head += n;
    }

    /// Advance `n` positions and run the new head's handler with its residual
    /// arguments. `token` is bound to the head; `None` binds a fresh root token.
    ///
    /// # Panics
    ///
    /// Panics under the same conditions as [`CallChain::advance`].
    pub fn advance_exec(&mut self, n: usize, token: Option<CancelToken>) -> anyhow::Result<()> {
        self.advance(n);

        let link = &mut self.links[self.head];
        link.token = Some(token.unwrap_or_default());
        let args = link.args.clone();
        let exec = link
            .command
            .executor()
            .ok_or_else(|| anyhow!("{} has no exec function", link.command.name()))?;

        exec(self, &args)
    }

    /// Peek at the command after the current one without advancing, binding
    /// `token` (or a fresh root token) to it. Returns `None` at the root.
    pub fn next(&mut self, token: Option<CancelToken>) -> Option<&Link> {
        if self.len() <= 1 {
            return None;
        }
        let link = &mut self.links[self.head + 1];
        link.token = Some(token.unwrap_or_default());
        Some(link)
    }

    pub fn current(&self) -> &Link {
        &self.links[self.head]
    }

    /// Reset the flags of every command the dispatch visited, including the
    /// ones the handlers advanced past.
    pub(crate) fn clean(&self) {
        for link in &self.links {
            link.command.reset_flags();
        }
    }
}

impl Drop for CallChain {
    fn drop(&mut self) {
        self.clean();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::{ArghArgs, ArghFlags};
    use argh::FromArgs;
    use parking_lot::Mutex;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    /// Builds `a -> b -> c` where every handler records its name and advances.
    fn recording_tree(log: &Arc<Mutex<Vec<String>>>) -> Arc<Command> {
        let recorder = |name: &'static str| {
            let log = Arc::clone(log);
            move |chain: &mut CallChain, args: &[String]| -> anyhow::Result<()> {
                log.lock().push(format!("{name}{args:?}"));
                if chain.next(None).is_some() {
                    chain.advance_exec(1, None)?;
                }
                Ok(())
            }
        };

        let c = Command::new("c").exec(recorder("c"));
        let b = Command::new("b").exec(recorder("b")).subcommand(c);
        Arc::new(Command::new("a").exec(recorder("a")).subcommand(b))
    }

    #[test]
    fn test_advance_exec_runs_leaf_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = recording_tree(&log);

        let mut chain = a.parse(&strings(&["1", "b", "2", "c", "3"])).unwrap();
        assert_eq!(chain.len(), 3);
        chain.advance_exec(0, None).unwrap();

        assert_eq!(
            *log.lock(),
            [r#"c["3"]"#, r#"b["2"]"#, r#"a["1"]"#]
        );
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.current().command().name(), "a");
    }

    #[test]
    #[should_panic(expected = "cannot advance")]
    fn test_advance_past_end_panics() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = recording_tree(&log).parse(&strings(&["b"])).unwrap();
        chain.advance(2);
    }

    #[test]
    fn test_advance_to_root_is_allowed() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = recording_tree(&log).parse(&strings(&["b", "c"])).unwrap();
        chain.advance(2);
        assert_eq!(chain.current().command().name(), "a");
        assert!(chain.next(None).is_none());
    }

    #[test]
    fn test_next_binds_token_without_advancing() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = recording_tree(&log).parse(&strings(&["b"])).unwrap();
        let token = CancelToken::new();
        token.cancel();

        let next = chain.next(Some(token)).unwrap();
        assert_eq!(next.command().name(), "a");
        assert!(next.token().is_cancelled());
        assert_eq!(chain.current().command().name(), "b");
    }

    #[test]
    fn test_handler_sees_bound_token() {
        let seen = Arc::new(Mutex::new(None));
        let command = {
            let seen = Arc::clone(&seen);
            Arc::new(Command::new("t").exec(move |chain, _| {
                *seen.lock() = Some(chain.current().token().is_cancelled());
                Ok(())
            }))
        };

        let token = CancelToken::new();
        token.cancel();
        command.parse(&[]).unwrap().advance_exec(0, Some(token)).unwrap();
        assert_eq!(*seen.lock(), Some(true));
    }

    #[derive(FromArgs)]
    /// counter flags.
    struct Count {
        #[argh(option, short = 'n', default = "1")]
        /// count.
        n: u32,

        #[argh(positional, greedy)]
        /// rest.
        rest: Vec<String>,
    }

    impl ArghArgs for Count {
        fn positionals(&self) -> &[String] {
            &self.rest
        }
    }

    #[test]
    fn test_clean_resets_every_visited_command() {
        let (root_flags, root_value) = ArghFlags::<Count>::new();
        let (leaf_flags, leaf_value) = ArghFlags::<Count>::new();

        let leaf = Command::new("leaf")
            .flags(leaf_flags)
            .exec(|chain, _| chain.advance_exec(1, None));
        let root = Arc::new(
            Command::new("root")
                .flags(root_flags)
                .subcommand(leaf)
                .exec(|_, _| Ok(())),
        );

        let mut chain = root.parse(&strings(&["-n", "5", "leaf", "-n", "9"])).unwrap();
        assert_eq!(root_value.with(|v| v.map(|c| c.n)), Some(5));
        assert_eq!(leaf_value.with(|v| v.map(|c| c.n)), Some(9));

        chain.advance_exec(0, None).unwrap();
        assert_eq!(chain.len(), 1);

        chain.clean();
        assert!(!root_value.is_set());
        assert!(!leaf_value.is_set());
    }

    #[test]
    fn test_dropping_chain_resets_flags() {
        let (flags, value) = ArghFlags::<Count>::new();
        let leaf = Arc::new(
            Command::new("leaf")
                .flags(flags)
                .exec(|_, _| anyhow::bail!("handler gave up")),
        );

        let mut chain = leaf.parse(&strings(&["-n", "3"])).unwrap();
        assert!(format!("{chain:?}").contains("leaf"));
        assert!(chain.advance_exec(0, None).is_err());
        assert!(value.is_set());

        drop(chain);
        assert!(!value.is_set());
    }
}
