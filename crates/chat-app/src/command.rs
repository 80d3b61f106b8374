/// One line of terminal input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Free text sent as a prompt.
    Prompt(String),
    NewConversation,
    OpenConversation(String),
    ListModels,
    /// `/model` with no argument clears the pin and defers to settings.
    SelectModel(Option<String>),
    SetDefaultModel(String),
    Help,
    Quit,
    Unknown(String),
    Empty,
}

pub const HELP: &str = "\
commands:
  /new              start a new conversation
  /open <id>        reopen a saved conversation
  /models           list models offered by the default provider
  /model [id]       use a model for this conversation (no id: use the default)
  /default <id>     save the default chat model
  /help             show this help
  /quit             exit";

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Self::Prompt(line.to_string());
        };

        let (name, argument) = match rest.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, argument.trim()),
            None => (rest, ""),
        };
        let argument = (!argument.is_empty()).then(|| argument.to_string());

        match (name, argument) {
            ("new", None) => Self::NewConversation,
            ("open", Some(id)) => Self::OpenConversation(id),
            ("models", None) => Self::ListModels,
            ("model", model_id) => Self::SelectModel(model_id),
            ("default", Some(model_id)) => Self::SetDefaultModel(model_id),
            ("help", _) => Self::Help,
            ("quit" | "exit", _) => Self::Quit,
            _ => Self::Unknown(line.to_string()),
        }
    }
}
