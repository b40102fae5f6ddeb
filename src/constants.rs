pub const MAX_FRAMES_SIZE: usize = 256;
pub const MAX_STACK_SIZE: usize = MAX_FRAMES_SIZE * (u8::MAX as usize + 1);
pub const MAX_LOCALS: usize = u8::MAX as usize + 1;
pub const MAX_UPVALUES: usize = u8::MAX as usize + 1;
pub const MAX_CONSTANTS: usize = u8::MAX as usize + 1;
pub const MAX_ARGUMENTS: usize = u8::MAX as usize;
pub const MAX_TEST_CASES: usize = u8::MAX as usize;

pub const RETVAL_NAME: &str = "retval";
pub const INIT_NAME: &str = "init";
pub const THIS_NAME: &str = "this";
pub const SUPER_NAME: &str = "super";
