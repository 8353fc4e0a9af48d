#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

pub(crate) const PATH_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "load",
        action: "load_image",
    },
    CommandSpec {
        command: "open",
        action: "load_image",
    },
    CommandSpec {
        command: "save",
        action: "save_image",
    },
];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "undo",
        action: "undo",
    },
    CommandSpec {
        command: "reset",
        action: "reset",
    },
    CommandSpec {
        command: "history",
        action: "history",
    },
    CommandSpec {
        command: "help",
        action: "help",
    },
    CommandSpec {
        command: "quit",
        action: "quit",
    },
    CommandSpec {
        command: "exit",
        action: "quit",
    },
];

pub const EDITOR_HELP_COMMANDS: &[&str] = &[
    "/load <path>",
    "/save [path]",
    "/undo",
    "/reset",
    "/history",
    "/help",
    "/quit",
];
