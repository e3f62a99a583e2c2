use std::borrow::Borrow;
use std::fmt::{Debug, Display, Formatter};
use std::ops::Deref;

use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub type TaskKeyRef = [u8];

/// Key naming a task or a piece of data. Keys are opaque byte strings
/// chosen by the client; worker listen addresses travel in the same
/// representation.
#[derive(Hash, PartialEq, Eq, Clone, Default, PartialOrd, Ord)]
pub struct TaskKey {
    bytes: Box<[u8]>,
}

#[inline]
pub fn to_key(string: &str) -> TaskKey {
    TaskKey::from(string)
}

#[inline]
pub fn key_ref_to_string(key: &TaskKeyRef) -> String {
    String::from_utf8_lossy(key).to_string()
}

impl TaskKey {
    #[inline]
    pub fn as_bytes(&self) -> &TaskKeyRef {
        &self.bytes
    }
}

impl Display for TaskKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.write_str(&String::from_utf8_lossy(&self.bytes))
    }
}

impl Debug for TaskKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        Display::fmt(self, f)
    }
}

impl From<String> for TaskKey {
    #[inline]
    fn from(data: String) -> Self {
        data.into_bytes().into()
    }
}

impl From<Vec<u8>> for TaskKey {
    #[inline]
    fn from(data: Vec<u8>) -> Self {
        TaskKey {
            bytes: data.into_boxed_slice(),
        }
    }
}

impl From<&TaskKeyRef> for TaskKey {
    #[inline]
    fn from(data: &TaskKeyRef) -> Self {
        TaskKey {
            bytes: Box::from(data),
        }
    }
}

impl From<&str> for TaskKey {
    #[inline]
    fn from(data: &str) -> Self {
        TaskKey {
            bytes: Box::from(data.as_bytes()),
        }
    }
}

impl Borrow<TaskKeyRef> for TaskKey {
    #[inline]
    fn borrow(&self) -> &TaskKeyRef {
        self.deref()
    }
}

impl AsRef<TaskKeyRef> for TaskKey {
    #[inline]
    fn as_ref(&self) -> &TaskKeyRef {
        self.deref()
    }
}

impl Deref for TaskKey {
    type Target = TaskKeyRef;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.bytes
    }
}

impl Serialize for TaskKey {
    #[inline]
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&String::from_utf8_lossy(&self.bytes))
    }
}

struct TaskKeyVisitor;

impl<'a> Visitor<'a> for TaskKeyVisitor {
    type Value = TaskKey;

    fn expecting(&self, formatter: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        formatter.write_str("a task key")
    }

    #[inline]
    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(v.into())
    }

    #[inline]
    fn visit_string<E>(self, v: String) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(v.into())
    }

    #[inline]
    fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(v.into())
    }

    #[inline]
    fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(v.into())
    }
}

impl<'de> Deserialize<'de> for TaskKey {
    #[inline]
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_str(TaskKeyVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::{to_key, TaskKey};

    #[test]
    fn roundtrip_msgpack() {
        let key = to_key("('x-123', 0)");
        let bytes = rmp_serde::to_vec(&key).unwrap();
        let back: TaskKey = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(key, back);
    }

    #[test]
    fn display_lossy() {
        assert_eq!(format!("{}", to_key("abc")), "abc");
    }
}
