use crate::memory::frame;
use crate::test_runner::TestRunner;

/// Covers P1 (ref-count consistency) at the frame-allocator level and the
/// scenario-1 allocate/store/deallocate/free round trip.
pub fn run_frame_tests(runner: &mut TestRunner) {
    runner.run_test("alloc_sets_ref_count_to_one", || {
        let frame = frame::alloc().ok_or_else(|| alloc::string::String::from("out of frames"))?;
        let got = frame::get_ref(frame.start_address());
        frame::free(frame);
        runner.assert_eq(got, 1, "freshly allocated frame should have ref-count 1")
    });

    runner.run_test("free_returns_frame_to_free_list", || {
        let before = frame::free_count();
        let frame = frame::alloc().ok_or_else(|| alloc::string::String::from("out of frames"))?;
        runner.assert_eq(frame::free_count(), before - 1, "alloc should shrink the free list by one")?;
        frame::free(frame);
        runner.assert_eq(frame::free_count(), before, "free should restore the free list")
    });

    runner.run_test("inc_dec_ref_round_trip", || {
        let frame = frame::alloc().ok_or_else(|| alloc::string::String::from("out of frames"))?;
        let pa = frame.start_address();
        let r2 = frame::inc_ref(pa);
        runner.assert_eq(r2, 2, "inc_ref should raise the count to two")?;
        let r1 = frame::dec_ref(pa);
        runner.assert_eq(r1, 1, "dec_ref should lower the count back to one")?;
        frame::free(frame);
        runner.assert_eq(frame::get_ref(pa), 0, "final free should zero the count")
    });

    runner.run_test("double_dec_ref_would_underflow", || {
        // dec_ref panics below zero by contract (Double free / ref-count
        // underflow is an invariant violation, not a recoverable error);
        // exercised indirectly here by checking the boundary instead of
        // triggering the panic.
        let frame = frame::alloc().ok_or_else(|| alloc::string::String::from("out of frames"))?;
        let pa = frame.start_address();
        runner.assert_eq(frame::get_ref(pa), 1, "sole owner before any dec_ref")?;
        frame::free(frame);
        Ok(())
    });
}
