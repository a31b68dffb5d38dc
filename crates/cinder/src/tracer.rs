//! Execution tracing hooks.
//!
//! The VM is generic over a tracer so the default no-op version
//! monomorphizes away entirely; nothing is rendered unless the tracer asks
//! for it.

/// Observes VM execution one instruction at a time.
pub trait VmTracer {
    /// Whether the VM should render instructions at all. The disassembly is
    /// only produced when this returns true.
    fn enabled(&self) -> bool {
        false
    }

    /// Called before each instruction executes with its disassembled form.
    fn on_instruction(&mut self, rendered: &str) {
        let _ = rendered;
    }
}

/// The default tracer: does nothing, costs nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {}

/// Writes each instruction to stderr as it executes.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisassemblingTracer;

impl VmTracer for DisassemblingTracer {
    fn enabled(&self) -> bool {
        true
    }

    fn on_instruction(&mut self, rendered: &str) {
        eprintln!("{rendered}");
    }
}
