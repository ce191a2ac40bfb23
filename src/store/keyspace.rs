use super::Reply;
use crate::error::{ClusterError, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// A stored value.
#[derive(Debug, Clone, PartialEq)]
enum Entry {
    Str(String),
    Set(BTreeSet<String>),
    Hash(BTreeMap<String, String>),
}

/// In-memory keyspace understanding the Redis commands used by the
/// cluster scripts.
#[derive(Debug, Default)]
pub struct Keyspace {
    entries: HashMap<String, Entry>,
}

impl Keyspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Execute one command. `args[0]` is the command name.
    pub fn execute(&mut self, args: &[String]) -> Result<Reply> {
        let Some((name, args)) = args.split_first() else {
            return Err(ClusterError::Script("No command specified".to_string()));
        };

        let command = name.to_uppercase();
        match command.as_str() {
            "GET" => self.get(args),
            "SET" => self.set(args),
            "DEL" => self.del(args),
            "EXISTS" => self.exists(args),
            "INCR" => self.incr(args),
            "KEYS" => self.keys(args),
            "SADD" => self.sadd(args),
            "SREM" => self.srem(args),
            "SMEMBERS" => self.smembers(args),
            "SCARD" => self.scard(args),
            "SISMEMBER" => self.sismember(args),
            "HSET" => self.hset(args),
            "HSETNX" => self.hsetnx(args),
            "HGET" => self.hget(args),
            "HDEL" => self.hdel(args),
            "HGETALL" => self.hgetall(args),
            "HKEYS" => self.hkeys(args),
            "HLEN" => self.hlen(args),
            _ => Err(ClusterError::Script(format!(
                "Command not supported in scripts: {}",
                command
            ))),
        }
    }

    fn get(&self, args: &[String]) -> Result<Reply> {
        let [key] = args else {
            return Err(wrong_args("GET"));
        };
        match self.entries.get(key) {
            Some(Entry::Str(v)) => Ok(Reply::bulk(v.clone())),
            Some(_) => Err(wrong_type()),
            None => Ok(Reply::Nil),
        }
    }

    fn set(&mut self, args: &[String]) -> Result<Reply> {
        let [key, value] = args else {
            return Err(wrong_args("SET"));
        };
        self.entries.insert(key.clone(), Entry::Str(value.clone()));
        Ok(Reply::ok())
    }

    fn del(&mut self, args: &[String]) -> Result<Reply> {
        if args.is_empty() {
            return Err(wrong_args("DEL"));
        }
        let removed = args
            .iter()
            .filter(|k| self.entries.remove(*k).is_some())
            .count();
        Ok(Reply::Integer(removed as i64))
    }

    fn exists(&self, args: &[String]) -> Result<Reply> {
        if args.is_empty() {
            return Err(wrong_args("EXISTS"));
        }
        let found = args.iter().filter(|k| self.entries.contains_key(*k)).count();
        Ok(Reply::Integer(found as i64))
    }

    fn incr(&mut self, args: &[String]) -> Result<Reply> {
        let [key] = args else {
            return Err(wrong_args("INCR"));
        };
        let current = match self.entries.get(key) {
            Some(Entry::Str(v)) => v.parse::<i64>().map_err(|_| {
                ClusterError::Script("ERR value is not an integer or out of range".to_string())
            })?,
            Some(_) => return Err(wrong_type()),
            None => 0,
        };
        let next = current + 1;
        self.entries.insert(key.clone(), Entry::Str(next.to_string()));
        Ok(Reply::Integer(next))
    }

    fn keys(&self, args: &[String]) -> Result<Reply> {
        let [pattern] = args else {
            return Err(wrong_args("KEYS"));
        };
        let mut matched: Vec<&String> = self
            .entries
            .keys()
            .filter(|k| glob_match(pattern.as_bytes(), k.as_bytes()))
            .collect();
        matched.sort();
        Ok(Reply::Array(matched.into_iter().map(|k| Reply::bulk(k.clone())).collect()))
    }

    fn set_mut(&mut self, key: &str) -> Result<&mut BTreeSet<String>> {
        match self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Set(BTreeSet::new()))
        {
            Entry::Set(set) => Ok(set),
            _ => Err(wrong_type()),
        }
    }

    fn set_ref(&self, key: &str) -> Result<Option<&BTreeSet<String>>> {
        match self.entries.get(key) {
            Some(Entry::Set(set)) => Ok(Some(set)),
            Some(_) => Err(wrong_type()),
            None => Ok(None),
        }
    }

    fn sadd(&mut self, args: &[String]) -> Result<Reply> {
        let Some((key, members)) = args.split_first().filter(|(_, m)| !m.is_empty()) else {
            return Err(wrong_args("SADD"));
        };
        let set = self.set_mut(key)?;
        let added = members.iter().filter(|m| set.insert((*m).clone())).count();
        Ok(Reply::Integer(added as i64))
    }

    fn srem(&mut self, args: &[String]) -> Result<Reply> {
        let Some((key, members)) = args.split_first().filter(|(_, m)| !m.is_empty()) else {
            return Err(wrong_args("SREM"));
        };
        if self.set_ref(key)?.is_none() {
            return Ok(Reply::Integer(0));
        }
        let set = self.set_mut(key)?;
        let removed = members.iter().filter(|m| set.remove(*m)).count();
        if set.is_empty() {
            self.entries.remove(key);
        }
        Ok(Reply::Integer(removed as i64))
    }

    fn smembers(&self, args: &[String]) -> Result<Reply> {
        let [key] = args else {
            return Err(wrong_args("SMEMBERS"));
        };
        let members = self
            .set_ref(key)?
            .map(|set| set.iter().map(|m| Reply::bulk(m.clone())).collect())
            .unwrap_or_default();
        Ok(Reply::Array(members))
    }

    fn scard(&self, args: &[String]) -> Result<Reply> {
        let [key] = args else {
            return Err(wrong_args("SCARD"));
        };
        let count = self.set_ref(key)?.map(|s| s.len()).unwrap_or(0);
        Ok(Reply::Integer(count as i64))
    }

    fn sismember(&self, args: &[String]) -> Result<Reply> {
        let [key, member] = args else {
            return Err(wrong_args("SISMEMBER"));
        };
        let found = self
            .set_ref(key)?
            .map(|s| s.contains(member))
            .unwrap_or(false);
        Ok(Reply::Integer(found as i64))
    }

    fn hash_mut(&mut self, key: &str) -> Result<&mut BTreeMap<String, String>> {
        match self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Hash(BTreeMap::new()))
        {
            Entry::Hash(hash) => Ok(hash),
            _ => Err(wrong_type()),
        }
    }

    fn hash_ref(&self, key: &str) -> Result<Option<&BTreeMap<String, String>>> {
        match self.entries.get(key) {
            Some(Entry::Hash(hash)) => Ok(Some(hash)),
            Some(_) => Err(wrong_type()),
            None => Ok(None),
        }
    }

    fn hset(&mut self, args: &[String]) -> Result<Reply> {
        if args.len() < 3 || args.len() % 2 == 0 {
            return Err(wrong_args("HSET"));
        }
        let hash = self.hash_mut(&args[0])?;
        let mut created = 0;
        for pair in args[1..].chunks(2) {
            if hash.insert(pair[0].clone(), pair[1].clone()).is_none() {
                created += 1;
            }
        }
        Ok(Reply::Integer(created))
    }

    fn hsetnx(&mut self, args: &[String]) -> Result<Reply> {
        let [key, field, value] = args else {
            return Err(wrong_args("HSETNX"));
        };
        let hash = self.hash_mut(key)?;
        if hash.contains_key(field) {
            return Ok(Reply::Integer(0));
        }
        hash.insert(field.clone(), value.clone());
        Ok(Reply::Integer(1))
    }

    fn hget(&self, args: &[String]) -> Result<Reply> {
        let [key, field] = args else {
            return Err(wrong_args("HGET"));
        };
        Ok(self
            .hash_ref(key)?
            .and_then(|h| h.get(field))
            .map(|v| Reply::bulk(v.clone()))
            .unwrap_or(Reply::Nil))
    }

    fn hdel(&mut self, args: &[String]) -> Result<Reply> {
        let Some((key, fields)) = args.split_first().filter(|(_, f)| !f.is_empty()) else {
            return Err(wrong_args("HDEL"));
        };
        if self.hash_ref(key)?.is_none() {
            return Ok(Reply::Integer(0));
        }
        let hash = self.hash_mut(key)?;
        let removed = fields.iter().filter(|f| hash.remove(*f).is_some()).count();
        if hash.is_empty() {
            self.entries.remove(key);
        }
        Ok(Reply::Integer(removed as i64))
    }

    fn hgetall(&self, args: &[String]) -> Result<Reply> {
        let [key] = args else {
            return Err(wrong_args("HGETALL"));
        };
        let items = self
            .hash_ref(key)?
            .map(|h| {
                h.iter()
                    .flat_map(|(k, v)| [Reply::bulk(k.clone()), Reply::bulk(v.clone())])
                    .collect()
            })
            .unwrap_or_default();
        Ok(Reply::Array(items))
    }

    fn hkeys(&self, args: &[String]) -> Result<Reply> {
        let [key] = args else {
            return Err(wrong_args("HKEYS"));
        };
        let fields = self
            .hash_ref(key)?
            .map(|h| h.keys().map(|k| Reply::bulk(k.clone())).collect())
            .unwrap_or_default();
        Ok(Reply::Array(fields))
    }

    fn hlen(&self, args: &[String]) -> Result<Reply> {
        let [key] = args else {
            return Err(wrong_args("HLEN"));
        };
        let len = self.hash_ref(key)?.map(|h| h.len()).unwrap_or(0);
        Ok(Reply::Integer(len as i64))
    }
}

fn wrong_args(command: &str) -> ClusterError {
    ClusterError::Script(format!(
        "ERR wrong number of arguments for '{}' command",
        command.to_lowercase()
    ))
}

fn wrong_type() -> ClusterError {
    ClusterError::Script(
        "WRONGTYPE Operation against a key holding the wrong kind of value".to_string(),
    )
}

/// Redis-style glob matching supporting `*` and `?`.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some(b'*') => {
                star = Some((p, t));
                p += 1;
            }
            Some(&c) if c == b'?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match star {
                Some((sp, st)) => {
                    p = sp + 1;
                    t = st + 1;
                    star = Some((sp, st + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|&c| c == b'*')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(ks: &mut Keyspace, parts: &[&str]) -> Result<Reply> {
        let args: Vec<String> = parts.iter().map(|s| s.to_string()).collect();
        ks.execute(&args)
    }

    #[test]
    fn test_string_commands() {
        let mut ks = Keyspace::new();
        assert_eq!(cmd(&mut ks, &["GET", "k"]).unwrap(), Reply::Nil);
        assert_eq!(cmd(&mut ks, &["set", "k", "v"]).unwrap(), Reply::ok());
        assert_eq!(cmd(&mut ks, &["GET", "k"]).unwrap(), Reply::bulk("v"));
        assert_eq!(cmd(&mut ks, &["EXISTS", "k", "missing"]).unwrap(), Reply::Integer(1));
        assert_eq!(cmd(&mut ks, &["DEL", "k", "missing"]).unwrap(), Reply::Integer(1));
        assert!(ks.is_empty());
    }

    #[test]
    fn test_incr() {
        let mut ks = Keyspace::new();
        assert_eq!(cmd(&mut ks, &["INCR", "v"]).unwrap(), Reply::Integer(1));
        assert_eq!(cmd(&mut ks, &["INCR", "v"]).unwrap(), Reply::Integer(2));
        assert_eq!(cmd(&mut ks, &["GET", "v"]).unwrap(), Reply::bulk("2"));

        cmd(&mut ks, &["SET", "s", "abc"]).unwrap();
        assert!(cmd(&mut ks, &["INCR", "s"]).is_err());
    }

    #[test]
    fn test_set_commands() {
        let mut ks = Keyspace::new();
        assert_eq!(cmd(&mut ks, &["SADD", "s", "a", "b", "a"]).unwrap(), Reply::Integer(2));
        assert_eq!(cmd(&mut ks, &["SCARD", "s"]).unwrap(), Reply::Integer(2));
        assert_eq!(cmd(&mut ks, &["SISMEMBER", "s", "a"]).unwrap(), Reply::Integer(1));
        assert_eq!(
            cmd(&mut ks, &["SMEMBERS", "s"]).unwrap(),
            Reply::Array(vec![Reply::bulk("a"), Reply::bulk("b")])
        );
        assert_eq!(cmd(&mut ks, &["SREM", "s", "a", "b"]).unwrap(), Reply::Integer(2));
        // empty sets disappear, like in Redis
        assert!(ks.is_empty());
        assert_eq!(cmd(&mut ks, &["SREM", "s", "a"]).unwrap(), Reply::Integer(0));
    }

    #[test]
    fn test_hash_commands() {
        let mut ks = Keyspace::new();
        assert_eq!(cmd(&mut ks, &["HSET", "h", "f1", "v1", "f2", "v2"]).unwrap(), Reply::Integer(2));
        assert_eq!(cmd(&mut ks, &["HSET", "h", "f1", "v3"]).unwrap(), Reply::Integer(0));
        assert_eq!(cmd(&mut ks, &["HSETNX", "h", "f1", "v4"]).unwrap(), Reply::Integer(0));
        assert_eq!(cmd(&mut ks, &["HGET", "h", "f1"]).unwrap(), Reply::bulk("v3"));
        assert_eq!(cmd(&mut ks, &["HLEN", "h"]).unwrap(), Reply::Integer(2));
        assert_eq!(
            cmd(&mut ks, &["HGETALL", "h"]).unwrap(),
            Reply::Array(vec![
                Reply::bulk("f1"),
                Reply::bulk("v3"),
                Reply::bulk("f2"),
                Reply::bulk("v2"),
            ])
        );
        assert_eq!(cmd(&mut ks, &["HDEL", "h", "f1", "f2"]).unwrap(), Reply::Integer(2));
        assert!(ks.is_empty());
        assert!(cmd(&mut ks, &["HSET", "h", "f1"]).is_err());
    }

    #[test]
    fn test_wrong_type() {
        let mut ks = Keyspace::new();
        cmd(&mut ks, &["SADD", "s", "a"]).unwrap();
        assert!(cmd(&mut ks, &["HGET", "s", "a"]).is_err());
        assert!(cmd(&mut ks, &["GET", "s"]).is_err());
    }

    #[test]
    fn test_unknown_command() {
        let mut ks = Keyspace::new();
        assert!(cmd(&mut ks, &["FLUSHALL"]).is_err());
        assert!(ks.execute(&[]).is_err());
    }

    #[test]
    fn test_keys_pattern() {
        let mut ks = Keyspace::new();
        cmd(&mut ks, &["SET", "cluster:a", "1"]).unwrap();
        cmd(&mut ks, &["SET", "cluster:b", "1"]).unwrap();
        cmd(&mut ks, &["SET", "other", "1"]).unwrap();
        assert_eq!(
            cmd(&mut ks, &["KEYS", "cluster:*"]).unwrap(),
            Reply::Array(vec![Reply::bulk("cluster:a"), Reply::bulk("cluster:b")])
        );
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match(b"*", b""));
        assert!(glob_match(b"cluster:*", b"cluster:version:{i/c}"));
        assert!(glob_match(b"a?c", b"abc"));
        assert!(glob_match(b"a*b*c", b"axxbyyc"));
        assert!(!glob_match(b"a*b*c", b"axxbyy"));
        assert!(!glob_match(b"cluster:*", b"clusters"));
    }
}
