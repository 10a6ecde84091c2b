/// Static settings of a [`crate::Dialogue`].
///
/// Fields are public; build one directly or start from [`Config::default`] and
/// hand it to [`crate::DialogueBuilder::config`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    /// Written before every line is read, e.g. `"(echo) "`.
    pub prefix: String,
    /// Name of the synthesized help command; `None` disables it.
    pub help_command: Option<String>,
    /// Name of the synthesized quit command; `None` disables it.
    pub quit_command: Option<String>,
}

impl Config {
    /// Settings with both synthesized commands enabled under their usual names.
    pub fn interactive(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            help_command: Some("help".to_string()),
            quit_command: Some("quit".to_string()),
        }
    }
}
