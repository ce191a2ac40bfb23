use crate::error::{ClusterError, Result};

/// Value returned by a store command or script.
///
/// Mirrors the reply shapes of a Redis server once a Lua result has been
/// converted: integers, bulk strings, nested arrays and nil.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Nil,
    Status(String),
    Integer(i64),
    Bulk(String),
    Array(Vec<Reply>),
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Status("OK".to_string())
    }

    pub fn bulk(s: impl Into<String>) -> Self {
        Reply::Bulk(s.into())
    }

    pub fn into_integer(self) -> Result<i64> {
        match self {
            Reply::Integer(i) => Ok(i),
            Reply::Bulk(s) | Reply::Status(s) => s
                .parse()
                .map_err(|_| ClusterError::Store(format!("Expected integer reply, got '{}'", s))),
            other => Err(unexpected("integer", &other)),
        }
    }

    pub fn into_string(self) -> Result<String> {
        match self {
            Reply::Bulk(s) | Reply::Status(s) => Ok(s),
            Reply::Integer(i) => Ok(i.to_string()),
            other => Err(unexpected("string", &other)),
        }
    }

    /// Nil and the Lua `false` conversion both read as `None`.
    pub fn into_opt_string(self) -> Result<Option<String>> {
        match self {
            Reply::Nil => Ok(None),
            other => other.into_string().map(Some),
        }
    }

    pub fn into_array(self) -> Result<Vec<Reply>> {
        match self {
            Reply::Array(items) => Ok(items),
            // An empty Lua table converts to nil on some servers
            Reply::Nil => Ok(Vec::new()),
            other => Err(unexpected("array", &other)),
        }
    }

    pub fn into_strings(self) -> Result<Vec<String>> {
        self.into_array()?
            .into_iter()
            .map(Reply::into_string)
            .collect()
    }

    /// Decode a flat `[field, value, field, value, ...]` array.
    pub fn into_pairs(self) -> Result<Vec<(String, String)>> {
        let items = self.into_strings()?;
        if items.len() % 2 != 0 {
            return Err(ClusterError::Store(
                "Expected an even number of hash entries".to_string(),
            ));
        }
        let mut pairs = Vec::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
            pairs.push((k, v));
        }
        Ok(pairs)
    }
}

fn unexpected(expected: &str, got: &Reply) -> ClusterError {
    ClusterError::Store(format!("Expected {} reply, got {:?}", expected, got))
}

impl From<redis::Value> for Reply {
    fn from(value: redis::Value) -> Self {
        match value {
            redis::Value::Nil => Reply::Nil,
            redis::Value::Int(i) => Reply::Integer(i),
            redis::Value::Data(bytes) => Reply::Bulk(String::from_utf8_lossy(&bytes).into_owned()),
            redis::Value::Bulk(items) => Reply::Array(items.into_iter().map(Reply::from).collect()),
            redis::Value::Status(s) => Reply::Status(s),
            redis::Value::Okay => Reply::ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_from_bulk() {
        assert_eq!(Reply::bulk("42").into_integer().unwrap(), 42);
        assert!(Reply::bulk("x").into_integer().is_err());
    }

    #[test]
    fn test_nil_as_empty_array() {
        assert!(Reply::Nil.into_array().unwrap().is_empty());
    }

    #[test]
    fn test_into_pairs() {
        let reply = Reply::Array(vec![
            Reply::bulk("a"),
            Reply::bulk("1"),
            Reply::bulk("b"),
            Reply::bulk("2"),
        ]);
        assert_eq!(
            reply.into_pairs().unwrap(),
            vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())]
        );

        let odd = Reply::Array(vec![Reply::bulk("a")]);
        assert!(odd.into_pairs().is_err());
    }

    #[test]
    fn test_from_redis_value() {
        let value = redis::Value::Bulk(vec![
            redis::Value::Int(3),
            redis::Value::Data(b"room".to_vec()),
            redis::Value::Nil,
        ]);
        assert_eq!(
            Reply::from(value),
            Reply::Array(vec![Reply::Integer(3), Reply::bulk("room"), Reply::Nil])
        );
    }
}
