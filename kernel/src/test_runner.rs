use alloc::string::String;
use alloc::vec::Vec;

use crate::{serial_print, serial_println};

pub struct TestResult {
    pub name: &'static str,
    pub passed: bool,
    pub error: Option<String>,
}

pub struct TestRunner {
    results: Vec<TestResult>,
}

impl TestRunner {
    pub fn new() -> Self {
        TestRunner { results: Vec::new() }
    }

    pub fn run_test(&mut self, name: &'static str, test: impl FnOnce() -> Result<(), String>) {
        serial_print!("{}...\t", name);
        match test() {
            Ok(()) => {
                serial_println!("[ok]");
                self.results.push(TestResult { name, passed: true, error: None });
            }
            Err(e) => {
                serial_println!("[failed]\n{}", e);
                self.results.push(TestResult { name, passed: false, error: Some(e) });
            }
        }
    }

    pub fn assert(&self, cond: bool, msg: &str) -> Result<(), String> {
        if cond {
            Ok(())
        } else {
            Err(alloc::format!("assertion failed: {}", msg))
        }
    }

    pub fn assert_eq<T: core::fmt::Debug + PartialEq>(&self, left: T, right: T, msg: &str) -> Result<(), String> {
        if left == right {
            Ok(())
        } else {
            Err(alloc::format!("{}: {:?} != {:?}", msg, left, right))
        }
    }

    pub fn summary(&self) -> (usize, usize) {
        let passed = self.results.iter().filter(|r| r.passed).count();
        (passed, self.results.len())
    }
}

/// Dispatches to each VM-subsystem test group. Mirrors the teacher's
/// `run_all_tests` / `run_<name>_tests(&mut TestRunner)` convention; the
/// groups here cover the core this crate adds rather than the teacher's
/// unrelated subsystems (sound, nvme, pcie, ...), which have no counterpart
/// here. Only ever compiled into a test build, since it dispatches into
/// `crate::tests`, which is itself `#[cfg(test)]`-gated.
#[cfg(test)]
pub fn run_all_tests() {
    let mut runner = TestRunner::new();

    crate::tests::frame_tests::run_frame_tests(&mut runner);
    crate::tests::pte_tests::run_pte_tests(&mut runner);
    crate::tests::swap_tests::run_swap_tests(&mut runner);
    crate::tests::fault_tests::run_fault_tests(&mut runner);

    let (passed, total) = runner.summary();
    serial_println!("test result: {}/{} passed", passed, total);
}

/// `#[test_runner]` target for the `custom_test_frameworks` harness: runs
/// whatever `#[test_case]`-annotated functions the harness collected, then
/// the real VM-subsystem suite, same as the teacher's own `test_runner` fn
/// in `main.rs` also calls `test_runner::run_all_tests()` after its
/// `#[test_case]` loop.
#[cfg(test)]
pub fn test_runner(tests: &[&dyn Fn()]) {
    serial_println!("Running {} tests", tests.len());
    for test in tests {
        test();
    }
    run_all_tests();
    crate::qemu_exit(crate::QemuExitCode::Success);
}
