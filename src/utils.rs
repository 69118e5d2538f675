pub mod converge;

pub use converge::await_converge;
