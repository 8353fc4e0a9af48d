use super::command_registry::{CommandSpec, NO_ARG_COMMANDS, PATH_COMMANDS};

/// One line of editor input, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditorIntent {
    pub action: String,
    pub raw: String,
    pub prompt: Option<String>,
    pub path: Option<String>,
}

impl EditorIntent {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            prompt: None,
            path: None,
        }
    }
}

fn find_action(command: &str, specs: &[CommandSpec]) -> Option<&'static str> {
    specs
        .iter()
        .find(|spec| spec.command == command)
        .map(|spec| spec.action)
}

fn parse_path_arg(arg: &str) -> Option<String> {
    if arg.trim().is_empty() {
        return None;
    }
    let parts = match shell_words::split(arg) {
        Ok(parts) => parts,
        Err(_) => arg.split_whitespace().map(str::to_string).collect(),
    };
    let joined = parts
        .into_iter()
        .filter(|value| !value.is_empty())
        .collect::<Vec<String>>()
        .join(" ");
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

pub fn parse_intent(text: &str) -> EditorIntent {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return EditorIntent::new("noop", text);
    }

    if let Some(slash_tail) = raw_trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        if command_len > 0 {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let arg = slash_tail[command_len..].trim();

            if let Some(action) = find_action(&command, PATH_COMMANDS) {
                let mut intent = EditorIntent::new(action, text);
                intent.path = parse_path_arg(arg);
                return intent;
            }

            if let Some(action) = find_action(&command, NO_ARG_COMMANDS) {
                return EditorIntent::new(action, text);
            }

            let mut intent = EditorIntent::new("unknown", text);
            intent.prompt = Some(command);
            return intent;
        }
    }

    let mut intent = EditorIntent::new("edit", text);
    intent.prompt = Some(raw_trimmed.to_string());
    intent
}
