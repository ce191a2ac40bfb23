use super::{Keyspace, Reply, Script, ScriptRunner};
use crate::error::{ClusterError, Result};
use async_trait::async_trait;
use mlua::{Function, Lua, LuaOptions, MultiValue, StdLib, Value as LuaValue};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Lua VM and the compiled scripts, keyed by SHA1 digest.
struct Engine {
    lua: Lua,
    functions: HashMap<String, Function>,
}

/// In-process script runner.
///
/// Scripts run one at a time inside a single Lua VM, which makes each of
/// them atomic with respect to the keyspace, like on a Redis server.
pub struct EmbeddedRunner {
    engine: Mutex<Engine>,
}

impl EmbeddedRunner {
    pub fn new() -> Result<Self> {
        let keyspace = Arc::new(Mutex::new(Keyspace::new()));

        let lua = Lua::new_with(
            StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8,
            LuaOptions::default(),
        )
        .map_err(|e| ClusterError::Script(format!("Failed to create Lua instance: {}", e)))?;

        let redis_table = lua.create_table()?;

        // redis.call - raises a Lua error on failure
        let keyspace_for_call = Arc::clone(&keyspace);
        let call_fn = lua.create_function(move |lua_ctx, args: MultiValue| {
            Self::redis_call(&keyspace_for_call, lua_ctx, args, true)
        })?;
        redis_table.set("call", call_fn)?;

        // redis.pcall - returns an error table instead of raising
        let keyspace_for_pcall = Arc::clone(&keyspace);
        let pcall_fn = lua.create_function(move |lua_ctx, args: MultiValue| {
            Self::redis_call(&keyspace_for_pcall, lua_ctx, args, false)
        })?;
        redis_table.set("pcall", pcall_fn)?;

        lua.globals().set("redis", redis_table)?;

        Ok(Self {
            engine: Mutex::new(Engine {
                lua,
                functions: HashMap::new(),
            }),
        })
    }

    fn run(&self, script: &Script, keys: &[String], args: &[String]) -> Result<Reply> {
        let mut engine = self
            .engine
            .lock()
            .map_err(|e| ClusterError::Store(format!("Lock error: {}", e)))?;
        let Engine { lua, functions } = &mut *engine;

        let function = match functions.get(script.sha1()) {
            Some(f) => f.clone(),
            None => {
                let f = lua
                    .load(script.source())
                    .set_name(script.name())
                    .into_function()
                    .map_err(|e| {
                        ClusterError::Script(format!("Failed to compile {}: {}", script.name(), e))
                    })?;
                functions.insert(script.sha1().to_string(), f.clone());
                f
            }
        };

        // KEYS and ARGV are 1-indexed Lua tables
        let keys_table = lua.create_sequence_from(keys.iter().cloned())?;
        let argv_table = lua.create_sequence_from(args.iter().cloned())?;
        lua.globals().set("KEYS", keys_table)?;
        lua.globals().set("ARGV", argv_table)?;

        let result: LuaValue = function.call(()).map_err(|e| {
            ClusterError::Script(format!("Script {} execution error: {}", script.name(), e))
        })?;

        Self::lua_to_reply(result)
    }

    /// Execute a store command from Lua
    fn redis_call(
        keyspace: &Mutex<Keyspace>,
        lua: &Lua,
        args: MultiValue,
        throw_error: bool,
    ) -> mlua::Result<LuaValue> {
        let mut cmd_args: Vec<String> = Vec::new();

        for arg in args {
            match arg {
                LuaValue::String(s) => {
                    cmd_args.push(s.to_string_lossy());
                }
                LuaValue::Integer(i) => cmd_args.push(i.to_string()),
                LuaValue::Number(n) => cmd_args.push(n.to_string()),
                _ => {
                    return Self::call_error(
                        lua,
                        "Lua redis() command arguments must be strings or integers".to_string(),
                        throw_error,
                    );
                }
            }
        }

        let result = keyspace
            .lock()
            .map_err(|e| ClusterError::Store(format!("Lock error: {}", e)))
            .and_then(|mut ks| ks.execute(&cmd_args));

        match result {
            Ok(reply) => Self::reply_to_lua(lua, reply),
            Err(e) => Self::call_error(lua, e.to_string(), throw_error),
        }
    }

    fn call_error(lua: &Lua, message: String, throw_error: bool) -> mlua::Result<LuaValue> {
        if throw_error {
            return Err(mlua::Error::RuntimeError(message));
        }
        let table = lua.create_table()?;
        table.set("err", message)?;
        Ok(LuaValue::Table(table))
    }

    /// Convert a Lua value to a reply, following the Redis conversion rules.
    fn lua_to_reply(value: LuaValue) -> Result<Reply> {
        match value {
            LuaValue::Nil | LuaValue::Boolean(false) => Ok(Reply::Nil),
            LuaValue::Boolean(true) => Ok(Reply::Integer(1)),
            LuaValue::Integer(i) => Ok(Reply::Integer(i)),
            // numbers are truncated to integers
            LuaValue::Number(n) => Ok(Reply::Integer(n as i64)),
            LuaValue::String(s) => Ok(Reply::Bulk(s.to_string_lossy())),
            LuaValue::Table(t) => {
                if let Ok(LuaValue::String(err)) = t.raw_get::<LuaValue>("err") {
                    return Err(ClusterError::Script(err.to_string_lossy()));
                }
                if let Ok(LuaValue::String(ok)) = t.raw_get::<LuaValue>("ok") {
                    return Ok(Reply::Status(ok.to_string_lossy()));
                }

                // arrays stop at the first nil
                let mut items = Vec::new();
                for i in 1..=t.raw_len() {
                    match t.raw_get::<LuaValue>(i)? {
                        LuaValue::Nil => break,
                        item => items.push(Self::lua_to_reply(item)?),
                    }
                }
                Ok(Reply::Array(items))
            }
            _ => Ok(Reply::Nil),
        }
    }

    /// Convert a reply to a Lua value, following the Redis conversion rules.
    fn reply_to_lua(lua: &Lua, reply: Reply) -> mlua::Result<LuaValue> {
        match reply {
            Reply::Nil => Ok(LuaValue::Boolean(false)),
            Reply::Integer(i) => Ok(LuaValue::Integer(i)),
            Reply::Status(s) => {
                let table = lua.create_table()?;
                table.set("ok", s)?;
                Ok(LuaValue::Table(table))
            }
            Reply::Bulk(s) => Ok(LuaValue::String(lua.create_string(&s)?)),
            Reply::Array(items) => {
                let table = lua.create_table()?;
                for (i, item) in items.into_iter().enumerate() {
                    table.raw_set(i + 1, Self::reply_to_lua(lua, item)?)?;
                }
                Ok(LuaValue::Table(table))
            }
        }
    }
}

#[async_trait]
impl ScriptRunner for EmbeddedRunner {
    async fn eval(&self, script: &Script, keys: &[String], args: &[String]) -> Result<Reply> {
        let reply = self.run(script, keys, args);
        trace!(script = script.name(), ?reply, "embedded eval");
        reply
    }
}
