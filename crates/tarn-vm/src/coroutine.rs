//! Coroutines: separate stack pairs swapped in and out of the VM on
//! resume and yield.

use crate::callstack::{CallStack, FLAG_RESUME_ENTRY_POINT};
use crate::error::LuaError;
use crate::stack::FastStack;
use crate::vm::Vm;
use tarn_core::value::{ThreadId, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoroutineState {
    /// The host thread.
    Main,
    NotStarted,
    Running,
    Suspended,
    /// Resumed another coroutine and waits for it.
    Normal,
    Dead,
}

impl CoroutineState {
    /// Name reported by `coroutine.status`.
    pub fn name(self) -> &'static str {
        match self {
            CoroutineState::Main | CoroutineState::Running => "running",
            CoroutineState::NotStarted | CoroutineState::Suspended => "suspended",
            CoroutineState::Normal => "normal",
            CoroutineState::Dead => "dead",
        }
    }
}

/// The per-thread part of the VM.
#[derive(Debug, Default)]
pub(crate) struct ThreadState {
    pub stack: FastStack<Value>,
    pub call_stack: CallStack,
    pub can_yield: bool,
    pub saved_ip: Option<usize>,
}

#[derive(Debug)]
pub(crate) struct Coroutine {
    pub state: CoroutineState,
    pub function: Value,
    /// The coroutine's stacks while it is not running; the resumer's while
    /// it is.
    pub saved: ThreadState,
    /// Error value of the uncaught error that killed the coroutine.
    pub last_error: Option<Value>,
}

impl Coroutine {
    pub fn main() -> Self {
        Coroutine {
            state: CoroutineState::Main,
            function: Value::Nil,
            saved: ThreadState::default(),
            last_error: None,
        }
    }
}

impl Vm {
    fn coroutine_index(&self, thread: ThreadId) -> Result<usize, LuaError> {
        let index = thread.0 as usize;
        if index < self.coroutines.len() {
            Ok(index)
        } else {
            Err(LuaError::internal(format!("unknown coroutine {}", thread.0)))
        }
    }

    /// Exchanges the live stacks with the ones saved in `thread`.
    fn swap_thread_state(&mut self, index: usize) {
        let saved = &mut self.coroutines[index].saved;
        std::mem::swap(&mut self.stack, &mut saved.stack);
        std::mem::swap(&mut self.call_stack, &mut saved.call_stack);
        std::mem::swap(&mut self.can_yield, &mut saved.can_yield);
        std::mem::swap(&mut self.saved_ip, &mut saved.saved_ip);
    }

    /// A new suspended coroutine running `function`, which must be a Lua
    /// function.
    pub fn create_coroutine(&mut self, function: Value) -> Result<Value, LuaError> {
        if !matches!(function, Value::Function(_)) {
            return Err(LuaError::Argument("Lua function expected".into()));
        }
        let id = ThreadId(self.coroutines.len() as u32);
        self.coroutines.push(Coroutine {
            state: CoroutineState::NotStarted,
            function,
            saved: ThreadState {
                can_yield: true,
                ..Default::default()
            },
            last_error: None,
        });
        tracing::debug!(thread = id.0, "coroutine created");
        Ok(Value::Thread(id))
    }

    pub fn coroutine_status(&self, thread: ThreadId) -> Result<CoroutineState, LuaError> {
        Ok(self.coroutines[self.coroutine_index(thread)?].state)
    }

    /// The running coroutine, and whether it is the main thread.
    pub fn running(&self) -> (Value, bool) {
        (Value::Thread(self.running), self.running == ThreadId::MAIN)
    }

    pub fn is_yieldable(&self) -> bool {
        self.can_yield
    }

    /// Runs `thread` until it yields, returns or fails. Yielded and returned
    /// values come back as one value (a tuple for several).
    pub fn resume(&mut self, thread: ThreadId, args: Vec<Value>) -> Result<Value, LuaError> {
        let index = self.coroutine_index(thread)?;
        let state = self.coroutines[index].state;
        match state {
            CoroutineState::NotStarted | CoroutineState::Suspended => {}
            CoroutineState::Dead => return Err(LuaError::dead_coroutine()),
            _ => return Err(LuaError::non_suspended_coroutine()),
        }
        if self.native_depth >= self.options.max_native_depth {
            return Err(LuaError::stack_overflow());
        }
        self.native_depth += 1;

        let caller = self.running;
        if caller != ThreadId::MAIN {
            self.coroutines[caller.0 as usize].state = CoroutineState::Normal;
        }
        self.swap_thread_state(index);
        self.running = thread;
        self.coroutines[index].state = CoroutineState::Running;
        tracing::debug!(thread = thread.0, from = caller.0, "resume");

        let result = if state == CoroutineState::NotStarted {
            let function = self.coroutines[index].function.clone();
            self.call_inner(function, args, FLAG_RESUME_ENTRY_POINT)
        } else {
            match self.saved_ip.take() {
                Some(ip) => {
                    self.stack.push(Value::tuple(args));
                    self.processing_loop(ip)
                }
                None => Err(LuaError::internal("suspended coroutine without a resume point")),
            }
        };

        let outcome = match result {
            Ok(Value::YieldRequest(values)) => {
                self.coroutines[index].state = CoroutineState::Suspended;
                tracing::debug!(thread = thread.0, "yield");
                Ok(Value::Tuple(values))
            }
            Ok(value) => {
                self.coroutines[index].state = CoroutineState::Dead;
                tracing::debug!(thread = thread.0, "coroutine finished");
                Ok(value)
            }
            Err(e) => {
                if let LuaError::Runtime(script) = &e {
                    let value = self.error_value(script);
                    self.coroutines[index].last_error = Some(value);
                }
                self.coroutines[index].state = CoroutineState::Dead;
                tracing::debug!(thread = thread.0, error = %e, "coroutine died");
                Err(e)
            }
        };
        if self.coroutines[index].state == CoroutineState::Dead {
            self.stack.clear();
            self.call_stack.clear();
        }

        self.swap_thread_state(index);
        self.running = caller;
        if caller != ThreadId::MAIN {
            self.coroutines[caller.0 as usize].state = CoroutineState::Running;
        }
        self.native_depth -= 1;
        outcome
    }

    /// Kills `thread`, running the closers of its pending `<close>`
    /// variables. Returns the error value if a closer failed, or the error
    /// the coroutine died with.
    pub fn close_coroutine(&mut self, thread: ThreadId) -> Result<Option<Value>, LuaError> {
        let index = self.coroutine_index(thread)?;
        match self.coroutines[index].state {
            CoroutineState::NotStarted => {
                self.coroutines[index].state = CoroutineState::Dead;
                Ok(None)
            }
            CoroutineState::Dead => Ok(self.coroutines[index].last_error.clone()),
            CoroutineState::Suspended => {
                if self.native_depth >= self.options.max_native_depth {
                    return Err(LuaError::stack_overflow());
                }
                self.native_depth += 1;
                let caller = self.running;
                if caller != ThreadId::MAIN {
                    self.coroutines[caller.0 as usize].state = CoroutineState::Normal;
                }
                self.swap_thread_state(index);
                self.running = thread;
                // Closers run on this coroutine's stacks; a nested resume
                // must see it as running.
                self.coroutines[index].state = CoroutineState::Running;
                let mut first_error = None;
                while !self.call_stack.is_empty() {
                    if let Err(e) = self.close_all_pending_blocks(&Value::Nil) {
                        first_error.get_or_insert(e);
                    }
                    self.call_stack.pop();
                }
                self.stack.clear();
                self.saved_ip = None;
                self.swap_thread_state(index);
                self.running = caller;
                if caller != ThreadId::MAIN {
                    self.coroutines[caller.0 as usize].state = CoroutineState::Running;
                }
                self.coroutines[index].state = CoroutineState::Dead;
                self.native_depth -= 1;
                tracing::debug!(thread = thread.0, "coroutine closed");
                match first_error {
                    None => Ok(None),
                    Some(LuaError::Runtime(e)) => {
                        let value = self.error_value(&e);
                        self.coroutines[index].last_error = Some(value.clone());
                        Ok(Some(value))
                    }
                    Some(other) => Err(other),
                }
            }
            state => Err(LuaError::runtime(format!(
                "cannot close a {} coroutine",
                state.name()
            ))),
        }
    }
}
