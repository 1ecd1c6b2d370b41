//! The command vocabulary shared by the bot and its plugins.
//!
//! Host → plugin: `Started`, `Update`, `Privmsg`, `Joined`, `Invited`.
//! Plugin → host: `Say`, `Join`.

use std::collections::HashSet;

use crate::descriptor::{Arguments, Command, CommandDescriptor, CommandSet, FieldType};
use crate::error::ProtocolError;

macro_rules! field_type {
    (String) => { String };
    (Integer) => { i32 };
}

macro_rules! read_field {
    ($reader:ident, String) => { $reader.string()? };
    ($reader:ident, Integer) => { $reader.integer()? };
}

/// Declares a descriptor static and its typed struct in one go.
macro_rules! command {
    ($(#[$meta:meta])* $name:ident => $desc:ident { $($field:ident : $kind:ident),* $(,)? }) => {
        pub static $desc: CommandDescriptor = CommandDescriptor::new(
            stringify!($name),
            &[$((stringify!($field), FieldType::$kind)),*],
        );

        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct $name {
            $(pub $field: field_type!($kind),)*
        }

        impl Command for $name {
            const DESCRIPTOR: &'static CommandDescriptor = &$desc;

            #[allow(unused_mut)]
            fn into_arguments(self) -> Arguments {
                let mut args = Arguments::new();
                $(args.push(self.$field);)*
                args
            }

            #[allow(unused_mut, unused_variables)]
            fn from_arguments(args: Arguments) -> Result<Self, ProtocolError> {
                let mut reader = args.reader(&$desc);
                let out = Self { $($field: read_field!(reader, $kind),)* };
                reader.finish()?;
                Ok(out)
            }
        }
    };
}

command! {
    /// Sent once after the plugin is up, carrying its settings (JSON text).
    Started => STARTED { settings: String }
}

command! {
    /// Periodic tick.
    Update => UPDATE {}
}

command! {
    /// A message seen on a channel the bot is in.
    Privmsg => PRIVMSG { server_id: Integer, user: String, channel: String, message: String }
}

command! {
    /// Ask the bot to join a channel.
    Join => JOIN { server_id: Integer, channel: String }
}

command! {
    /// The bot joined a channel.
    Joined => JOINED { server_id: Integer, channel: String }
}

command! {
    /// Ask the bot to post a message.
    Say => SAY { server_id: Integer, channel: String, message: String }
}

command! {
    /// The bot was invited to a channel.
    Invited => INVITED { server_id: Integer, channel: String }
}

static ALL: [&CommandDescriptor; 7] = [&STARTED, &UPDATE, &PRIVMSG, &JOIN, &JOINED, &SAY, &INVITED];
static TO_HOST: [&CommandDescriptor; 2] = [&SAY, &JOIN];
static TO_PLUGIN: [&CommandDescriptor; 5] = [&STARTED, &UPDATE, &JOINED, &PRIVMSG, &INVITED];

/// Every command either side may name.
pub static VOCABULARY: CommandSet = CommandSet::new(&ALL);
/// Commands the host handles; the plugin's caller set.
pub static HOST_RESPONDERS: CommandSet = CommandSet::new(&TO_HOST);
/// Commands the plugin handles; the host's caller set.
pub static PLUGIN_RESPONDERS: CommandSet = CommandSet::new(&TO_PLUGIN);

/// Verifies that `callers` and `responders` are disjoint, together cover the
/// whole vocabulary, and name every command once.
pub fn check_complementary(callers: &CommandSet, responders: &CommandSet) -> Result<(), ProtocolError> {
    let mut seen = HashSet::new();
    for d in callers.iter().chain(responders.iter()) {
        if !VOCABULARY.contains(d) {
            return Err(ProtocolError::VocabularyMismatch(format!(
                "`{}` is not part of the shared vocabulary",
                d.name
            )));
        }
        if !seen.insert(d.name) {
            return Err(ProtocolError::VocabularyMismatch(format!(
                "`{}` is both issued and handled",
                d.name
            )));
        }
    }
    if let Some(missing) = VOCABULARY.iter().find(|d| !seen.contains(d.name)) {
        return Err(ProtocolError::VocabularyMismatch(format!(
            "`{}` is neither issued nor handled",
            missing.name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directions_partition_the_vocabulary() {
        assert!(check_complementary(&PLUGIN_RESPONDERS, &HOST_RESPONDERS).is_ok());
        assert!(check_complementary(&HOST_RESPONDERS, &PLUGIN_RESPONDERS).is_ok());
        assert!(HOST_RESPONDERS.is_disjoint(&PLUGIN_RESPONDERS));
    }

    #[test]
    fn overlapping_sets_are_rejected() {
        let err = check_complementary(&VOCABULARY, &HOST_RESPONDERS).unwrap_err();
        assert!(matches!(err, ProtocolError::VocabularyMismatch(_)));

        let err = check_complementary(&HOST_RESPONDERS, &HOST_RESPONDERS).unwrap_err();
        assert!(err.to_string().contains("both issued and handled"));
    }

    #[test]
    fn incomplete_sets_are_rejected() {
        let err = check_complementary(&HOST_RESPONDERS, &CommandSet::new(&[])).unwrap_err();
        assert!(err.to_string().contains("neither issued nor handled"));
    }

    #[test]
    fn typed_commands_match_descriptors() {
        let say = Say {
            server_id: 3,
            channel: "#ops".into(),
            message: "hi".into(),
        };
        let args = say.clone().into_arguments();
        assert!(SAY.check(&args).is_ok());
        assert_eq!(Say::from_arguments(args).unwrap(), say);

        assert!(UPDATE.check(&Update {}.into_arguments()).is_ok());
        assert!(Join::from_arguments(Arguments::new().with("#ops").with(3)).is_err());
    }
}
