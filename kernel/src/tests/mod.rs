pub mod fault_tests;
pub mod frame_tests;
pub mod pte_tests;
pub mod swap_tests;
