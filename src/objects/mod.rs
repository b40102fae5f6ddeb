pub mod object_class;
pub mod object_closure;
pub mod object_host;
pub mod object_instance;
pub mod object_native_function;
pub mod object_string;
pub mod object_upvalue;
