//! Lazily generated slow paths.
//!
//! A fast-tier unit reserves a patchable jump for every rarely taken path.
//! Until the path first runs, that jump leads to a dispatch thunk which calls
//! the runtime; the runtime generates the stub, rewrites the jump to point at
//! it, and returns into it. Every later arrival branches straight to the
//! stub.
//!
//! ```text
//!   fast code                 thunk                     runtime
//!   jmp thunk ─────────────►  save live regs  ───────►  resolve_slow_path
//!        │                    call operation            └─ LazySlowPath::generate
//!        │ (after patch)      ret ──► stub                  ├─ run generator
//!        └──────────────────────────► stub ──► continuation ├─ link + finalize
//!                                                           └─ repatch jump
//! ```

mod call;
mod descriptor;


pub use call::{lazy_call_generator, Argument};
pub use descriptor::{
    CallSiteIndex, GenerationParams, Generator, LazySlowPath, SlowPathSite, StubRoutine,
};
