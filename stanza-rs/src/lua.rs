//! Lua 5.4 engine behind the `<c:script lang="lua">` tag, via `mlua`.
//!
//! Enabled with the `lua` Cargo feature (on by default):
//! ```text
//! cargo build --no-default-features   # script tags then fail at render time
//! ```
//!
//! A [`Chunk`] is compiled to bytecode once when its tag is normalized.  Each
//! [`Interp`](crate::interp::Interp) owns one [`LuaRuntime`], created lazily
//! on the first script it runs.
//!
//! # Bindings
//!
//! | Direction | What |
//! |-----------|------|
//! | in  | every visible scope entry that has a Lua counterpart (scalars, lists, maps) |
//! | out | the chunk's first return value, and the top-level globals it created or changed |
//!
//! Scripts run in a private environment table seeded with the standard
//! library names below, so assignments never leak into the shared globals.

use crate::script::value::Value;

/// Library globals visible inside every chunk environment.
pub const LIBRARY_NAMES: &[&str] = &[
    "assert", "error", "ipairs", "next", "pairs", "pcall", "print", "select", "tonumber",
    "tostring", "type", "math", "string", "table", "utf8",
];

/// Result of one script run.
#[derive(Debug, Default)]
pub struct ScriptOutput {
    pub value: Value,
    /// Top-level names the chunk created or changed, in no particular order.
    /// Bindings it only read are left out.
    pub bindings: Vec<(String, Value)>,
}

#[cfg(feature = "lua")]
pub use lua_impl::{Chunk, LuaRuntime};

#[cfg(not(feature = "lua"))]
pub use disabled::{Chunk, LuaRuntime};

#[cfg(feature = "lua")]
mod lua_impl {
    use std::collections::HashMap;
    use std::sync::Arc;

    use mlua::prelude::*;
    use mlua::ChunkMode;
    use tracing::debug;

    use super::{ScriptOutput, LIBRARY_NAMES};
    use crate::error::Error;
    use crate::scope::Scope;
    use crate::script::value::Value;

    /// Nesting limit when converting maps and lists between the two worlds.
    const MAX_DEPTH: usize = 8;

    // ── Chunk ─────────────────────────────────────────────────────────────

    /// A compiled Lua chunk.  Cheap to clone and `Send + Sync`.
    #[derive(Debug, Clone)]
    pub struct Chunk {
        name: Arc<str>,
        source: Arc<str>,
        bytecode: Arc<Vec<u8>>,
    }

    impl Chunk {
        /// Compile `source`, surfacing syntax errors.  `name` appears in Lua
        /// tracebacks.
        pub fn compile(name: &str, source: &str) -> Result<Self, Error> {
            let lua = Lua::new();
            let function = lua
                .load(source)
                .set_name(format!("={name}"))
                .into_function()
                .map_err(|e| Error::Script(e.to_string()))?;
            // unstripped, so runtime errors keep line numbers
            let bytecode = function.dump(false);
            Ok(Chunk { name: name.into(), source: source.into(), bytecode: Arc::new(bytecode) })
        }

        pub fn source(&self) -> &str {
            &self.source
        }
    }

    // ── LuaRuntime ────────────────────────────────────────────────────────

    /// One Lua state per interpreter, created on first use.
    #[derive(Default)]
    pub struct LuaRuntime {
        lua: Option<Lua>,
    }

    impl LuaRuntime {
        fn state(&mut self) -> &Lua {
            self.lua.get_or_insert_with(|| {
                debug!("creating Lua state");
                Lua::new()
            })
        }

        /// Run `chunk` with `scope`'s visible entries as globals.
        pub fn run(&mut self, chunk: &Chunk, scope: &Scope) -> Result<ScriptOutput, Error> {
            let lua = self.state();
            run_chunk(lua, chunk, scope).map_err(|e| Error::Script(e.to_string()))
        }
    }

    fn run_chunk(lua: &Lua, chunk: &Chunk, scope: &Scope) -> LuaResult<ScriptOutput> {
        let globals = lua.globals();
        let env = lua.create_table()?;
        for name in LIBRARY_NAMES {
            env.set(*name, globals.get::<LuaValue>(*name)?)?;
        }
        // name -> value as the chunk first sees it
        let mut seeded = HashMap::new();
        for (name, value) in scope.flatten() {
            if name.starts_with('$') || LIBRARY_NAMES.contains(&name.as_str()) {
                continue;
            }
            let lv = to_lua(lua, &value, 0)?;
            if !lv.is_nil() {
                seeded.insert(name.clone(), from_lua(&lv, 0));
                env.set(name, lv)?;
            }
        }

        let result: LuaValue = lua
            .load(&*chunk.bytecode)
            .set_name(format!("={}", chunk.name))
            .set_mode(ChunkMode::Binary)
            .set_environment(env.clone())
            .call(())?;

        let mut bindings = Vec::new();
        for pair in env.pairs::<LuaValue, LuaValue>() {
            let (k, v) = pair?;
            let LuaValue::String(k) = k else { continue };
            let key = k.to_string_lossy().to_string();
            if LIBRARY_NAMES.contains(&key.as_str()) || matches!(v, LuaValue::Function(_)) {
                continue;
            }
            let value = from_lua(&v, 0);
            if seeded.get(&key) == Some(&value) {
                continue;
            }
            bindings.push((key, value));
        }
        debug!(seeded = seeded.len(), bound = bindings.len(), "script finished");
        Ok(ScriptOutput { value: from_lua(&result, 0), bindings })
    }

    // ── Conversions ───────────────────────────────────────────────────────

    fn to_lua(lua: &Lua, v: &Value, depth: usize) -> LuaResult<LuaValue> {
        if depth > MAX_DEPTH {
            return Ok(LuaValue::Nil);
        }
        Ok(match v {
            Value::Null => LuaValue::Nil,
            Value::Bool(b) => LuaValue::Boolean(*b),
            Value::Int(n) => LuaValue::Integer(*n),
            Value::Float(x) => LuaValue::Number(*x),
            Value::Str(s) => LuaValue::String(lua.create_string(s)?),
            Value::List(items) => {
                let t = lua.create_table()?;
                for (i, item) in items.read().iter().enumerate() {
                    t.raw_set(i as i64 + 1, to_lua(lua, item, depth + 1)?)?;
                }
                LuaValue::Table(t)
            }
            Value::Map(m) => {
                let t = lua.create_table()?;
                for (k, item) in m.entries() {
                    t.raw_set(k, to_lua(lua, &item, depth + 1)?)?;
                }
                LuaValue::Table(t)
            }
            Value::Error(e) => LuaValue::String(lua.create_string(&e.message)?),
            Value::Closure(_) | Value::Action(_) | Value::Object(_) => LuaValue::Nil,
        })
    }

    fn from_lua(v: &LuaValue, depth: usize) -> Value {
        match v {
            LuaValue::Nil => Value::Null,
            LuaValue::Boolean(b) => Value::Bool(*b),
            LuaValue::Integer(n) => Value::Int(*n),
            LuaValue::Number(x) => Value::Float(*x),
            LuaValue::String(s) => Value::Str(s.to_string_lossy().to_string()),
            LuaValue::Table(t) if depth < MAX_DEPTH => {
                if t.raw_len() > 0 {
                    let items = t
                        .clone()
                        .sequence_values::<LuaValue>()
                        .filter_map(Result::ok)
                        .map(|v| from_lua(&v, depth + 1))
                        .collect();
                    Value::list(items)
                } else {
                    let map = Scope::new();
                    for (k, v) in t.clone().pairs::<LuaValue, LuaValue>().filter_map(Result::ok) {
                        let key = match &k {
                            LuaValue::String(s) => s.to_string_lossy().to_string(),
                            other => from_lua(other, depth + 1).to_string(),
                        };
                        map.set(key, from_lua(&v, depth + 1));
                    }
                    Value::Map(map)
                }
            }
            _ => Value::Null,
        }
    }
}

#[cfg(not(feature = "lua"))]
mod disabled {
    use super::ScriptOutput;
    use crate::error::Error;
    use crate::scope::Scope;

    #[derive(Debug, Clone)]
    pub struct Chunk {
        source: std::sync::Arc<str>,
    }

    impl Chunk {
        pub fn compile(_name: &str, source: &str) -> Result<Self, Error> {
            Ok(Chunk { source: source.into() })
        }

        pub fn source(&self) -> &str {
            &self.source
        }
    }

    #[derive(Default)]
    pub struct LuaRuntime;

    impl LuaRuntime {
        pub fn run(&mut self, _chunk: &Chunk, _scope: &Scope) -> Result<ScriptOutput, Error> {
            Err(Error::Script("built without the `lua` feature".into()))
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(all(test, feature = "lua"))]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::scope::Scope;

    #[test]
    fn syntax_errors_surface_at_compile() {
        let err = Chunk::compile("bad", "x = = 1").unwrap_err();
        assert!(matches!(err, Error::Script(_)));
    }

    #[test]
    fn returns_value_and_reads_scope() {
        let scope = Scope::new();
        scope.set("n", Value::Int(20));
        scope.set("who", Value::from("lua"));
        let chunk = Chunk::compile("t", "return who .. ':' .. (n + 1)").unwrap();
        let out = LuaRuntime::default().run(&chunk, &scope).unwrap();
        assert_eq!(out.value, Value::from("lua:21"));
    }

    #[test]
    fn assignments_are_reported_not_leaked() {
        let scope = Scope::new();
        let chunk = Chunk::compile("t", "answer = 42; items = {1, 2}").unwrap();
        let mut rt = LuaRuntime::default();
        let out = rt.run(&chunk, &scope).unwrap();
        let answer = out.bindings.iter().find(|(k, _)| k == "answer").map(|(_, v)| v.clone());
        assert_eq!(answer, Some(Value::Int(42)));
        let items = out.bindings.iter().find(|(k, _)| k == "items").map(|(_, v)| v.to_string());
        assert_eq!(items.as_deref(), Some("[1, 2]"));

        // A second run in the same runtime starts from a clean environment.
        let probe = Chunk::compile("p", "return answer").unwrap();
        assert_eq!(rt.run(&probe, &scope).unwrap().value, Value::Null);
    }

    #[test]
    fn only_created_or_changed_names_are_reported() {
        let scope = Scope::new();
        scope.set("n", Value::Int(1));
        scope.set("xs", Value::list(vec![Value::Int(1)]));
        let mut rt = LuaRuntime::default();

        let out = rt.run(&Chunk::compile("t", "m = n + #xs").unwrap(), &scope).unwrap();
        let names: Vec<&str> = out.bindings.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, vec!["m"]);

        let out = rt.run(&Chunk::compile("t", "n = 3; xs[2] = 2").unwrap(), &scope).unwrap();
        let mut names: Vec<&str> = out.bindings.iter().map(|(k, _)| k.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["n", "xs"]);
    }

    #[test]
    fn compiled_chunk_runs_repeatedly() {
        let chunk = Chunk::compile("t", "return (k or 0) + 1").unwrap();
        let mut rt = LuaRuntime::default();
        for k in 0..3 {
            let scope: Scope = [("k", Value::Int(k))].into_iter().collect();
            assert_eq!(rt.run(&chunk, &scope).unwrap().value, Value::Int(k + 1));
        }
        assert_eq!(chunk.source(), "return (k or 0) + 1");
    }

    #[test]
    fn lists_and_maps_cross_over() {
        let scope = Scope::new();
        scope.set("xs", Value::list(vec![Value::Int(1), Value::Int(2), Value::Int(3)]));
        let m: Scope = [("k", Value::from("v"))].into_iter().collect();
        scope.set("m", Value::Map(m));
        let chunk = Chunk::compile("t", "return #xs .. m.k").unwrap();
        let out = LuaRuntime::default().run(&chunk, &scope).unwrap();
        assert_eq!(out.value, Value::from("3v"));
    }

    #[test]
    fn runtime_error_is_script_error() {
        let chunk = Chunk::compile("t", "error('boom')").unwrap();
        let err = LuaRuntime::default().run(&chunk, &Scope::new()).unwrap_err();
        assert!(matches!(err, Error::Script(m) if m.contains("boom")));
    }
}
