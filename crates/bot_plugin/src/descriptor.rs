//! Static declarations of remote commands.
//!
//! A [`CommandDescriptor`] names a command and lists its arguments in order.
//! Both ends of a pipe are compiled against the same descriptors; nothing
//! about them is negotiated on the wire.

use std::fmt;

use crate::error::ProtocolError;

/// Wire type of a single argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    /// UTF-8 text, carried as raw bytes.
    String,
    /// Signed 32-bit integer, carried as 4 big-endian bytes.
    Integer,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::String => f.write_str("string"),
            FieldType::Integer => f.write_str("integer"),
        }
    }
}

/// A decoded argument value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    String(String),
    Integer(i32),
}

impl Value {
    pub fn field_type(&self) -> FieldType {
        match self {
            Value::String(_) => FieldType::String,
            Value::Integer(_) => FieldType::Integer,
        }
    }

    /// Wire bytes of this value.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Value::String(s) => s.as_bytes().to_vec(),
            Value::Integer(i) => i.to_be_bytes().to_vec(),
        }
    }

    /// Parse wire bytes as a value of type `ty`.
    pub fn from_bytes(ty: FieldType, bytes: &[u8]) -> Result<Self, String> {
        match ty {
            FieldType::String => std::str::from_utf8(bytes)
                .map(|s| Value::String(s.to_owned()))
                .map_err(|e| format!("invalid utf-8: {e}")),
            FieldType::Integer => {
                let raw: [u8; 4] = bytes
                    .try_into()
                    .map_err(|_| format!("integer must be 4 bytes, got {}", bytes.len()))?;
                Ok(Value::Integer(i32::from_be_bytes(raw)))
            }
        }
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i)
    }
}

/// Positional argument list, in descriptor order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Arguments(Vec<Value>);

impl Arguments {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Builder-style push.
    pub fn with(mut self, value: impl Into<Value>) -> Self {
        self.0.push(value.into());
        self
    }

    pub fn push(&mut self, value: impl Into<Value>) {
        self.0.push(value.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Sequential typed access, used by [`Command::from_arguments`].
    pub fn reader(self, command: &'static CommandDescriptor) -> ArgumentReader {
        ArgumentReader {
            command,
            values: self.0.into_iter(),
            position: 0,
        }
    }
}

impl From<Vec<Value>> for Arguments {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

impl IntoIterator for Arguments {
    type Item = Value;
    type IntoIter = std::vec::IntoIter<Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Pops arguments off an [`Arguments`] list one at a time, checking types.
pub struct ArgumentReader {
    command: &'static CommandDescriptor,
    values: std::vec::IntoIter<Value>,
    position: usize,
}

impl ArgumentReader {
    fn next_value(&mut self, expected: FieldType) -> Result<Value, ProtocolError> {
        let position = self.position;
        self.position += 1;
        match self.values.next() {
            Some(v) if v.field_type() == expected => Ok(v),
            Some(v) => Err(self.command.mismatch(format!(
                "argument #{position} should be {expected}, got {}",
                v.field_type()
            ))),
            None => Err(self
                .command
                .mismatch(format!("missing argument #{position} ({expected})"))),
        }
    }

    pub fn string(&mut self) -> Result<String, ProtocolError> {
        match self.next_value(FieldType::String)? {
            Value::String(s) => Ok(s),
            Value::Integer(_) => unreachable!("type checked in next_value"),
        }
    }

    pub fn integer(&mut self) -> Result<i32, ProtocolError> {
        match self.next_value(FieldType::Integer)? {
            Value::Integer(i) => Ok(i),
            Value::String(_) => unreachable!("type checked in next_value"),
        }
    }

    /// Fails if arguments are left over.
    pub fn finish(mut self) -> Result<(), ProtocolError> {
        if self.values.next().is_some() {
            return Err(self.command.mismatch(format!(
                "expected {} argument(s), got more",
                self.command.arguments.len()
            )));
        }
        Ok(())
    }
}

/// Schema of one named remote operation.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct CommandDescriptor {
    pub name: &'static str,
    pub arguments: &'static [(&'static str, FieldType)],
}

impl CommandDescriptor {
    pub const fn new(name: &'static str, arguments: &'static [(&'static str, FieldType)]) -> Self {
        Self { name, arguments }
    }

    /// Name of the handler method conventionally bound to this command.
    pub fn handler_name(&self) -> String {
        self.name.to_lowercase()
    }

    /// Checks arity and types of `args` against this descriptor.
    pub fn check(&self, args: &Arguments) -> Result<(), ProtocolError> {
        if args.len() != self.arguments.len() {
            return Err(self.mismatch(format!(
                "expected {} argument(s), got {}",
                self.arguments.len(),
                args.len()
            )));
        }
        for ((field, expected), value) in self.arguments.iter().zip(args.values()) {
            if value.field_type() != *expected {
                return Err(self.mismatch(format!(
                    "`{field}` should be {expected}, got {}",
                    value.field_type()
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn mismatch(&self, reason: String) -> ProtocolError {
        ProtocolError::ArgumentMismatch {
            command: self.name.to_owned(),
            reason,
        }
    }
}

/// A fixed set of descriptors, looked up by name.
#[derive(Debug, Clone, Copy)]
pub struct CommandSet(&'static [&'static CommandDescriptor]);

impl CommandSet {
    pub const fn new(commands: &'static [&'static CommandDescriptor]) -> Self {
        Self(commands)
    }

    pub fn get(&self, name: &str) -> Option<&'static CommandDescriptor> {
        self.0.iter().copied().find(|d| d.name == name)
    }

    pub fn contains(&self, descriptor: &CommandDescriptor) -> bool {
        self.0.iter().any(|d| *d == descriptor)
    }

    pub fn iter(&self) -> impl Iterator<Item = &'static CommandDescriptor> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_disjoint(&self, other: &CommandSet) -> bool {
        !self.iter().any(|d| other.contains(d))
    }
}

/// A typed command: a struct whose fields are the descriptor's arguments.
pub trait Command: Sized {
    const DESCRIPTOR: &'static CommandDescriptor;

    fn into_arguments(self) -> Arguments;

    fn from_arguments(args: Arguments) -> Result<Self, ProtocolError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    static PAIR: CommandDescriptor =
        CommandDescriptor::new("Pair", &[("id", FieldType::Integer), ("label", FieldType::String)]);
    static EMPTY: CommandDescriptor = CommandDescriptor::new("Empty", &[]);

    #[test]
    fn check_accepts_matching_arguments() {
        let args = Arguments::new().with(7).with("seven");
        assert!(PAIR.check(&args).is_ok());
        assert!(EMPTY.check(&Arguments::new()).is_ok());
    }

    #[test]
    fn check_rejects_wrong_arity_and_types() {
        let short = Arguments::new().with(7);
        assert!(matches!(
            PAIR.check(&short),
            Err(ProtocolError::ArgumentMismatch { .. })
        ));

        let swapped = Arguments::new().with("seven").with(7);
        let err = PAIR.check(&swapped).unwrap_err();
        assert!(err.to_string().contains("`id` should be integer"));
    }

    #[test]
    fn integer_bytes_are_big_endian() {
        assert_eq!(Value::Integer(1).to_bytes(), vec![0, 0, 0, 1]);
        assert_eq!(
            Value::from_bytes(FieldType::Integer, &[0x7f, 0xff, 0xff, 0xff]).unwrap(),
            Value::Integer(i32::MAX)
        );
        assert!(Value::from_bytes(FieldType::Integer, &[0, 1]).is_err());
    }

    #[test]
    fn reader_walks_typed_values() {
        let mut r = Arguments::new().with(3).with("#ops").reader(&PAIR);
        assert_eq!(r.integer().unwrap(), 3);
        assert_eq!(r.string().unwrap(), "#ops");
        assert!(r.finish().is_ok());

        let mut r = Arguments::new().with("x").reader(&PAIR);
        assert!(r.integer().is_err());
    }

    #[test]
    fn command_set_lookup() {
        static SET: [&CommandDescriptor; 1] = [&PAIR];
        let set = CommandSet::new(&SET);
        assert!(set.get("Pair").is_some());
        assert!(set.get("pair").is_none());
        assert!(set.contains(&PAIR));
        assert!(!set.contains(&EMPTY));
        assert_eq!(PAIR.handler_name(), "pair");
    }
}
