// Stderr breadcrumbs that never panic.
//
// A host embedding the session may run without an attached console (GUI
// subsystem on Windows), where `eprintln!` panics on write errors. Write
// failures are ignored here instead.

#[macro_export]
macro_rules! safe_eprintln {
    ($($arg:tt)*) => {{
        use std::io::Write;
        let _ = writeln!(std::io::stderr(), $($arg)*);
    }};
}
