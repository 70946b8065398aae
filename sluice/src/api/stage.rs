//! The phases every operator node goes through in a superstep.

use crate::Result;

/// An operator node driven through the phases of a superstep.
///
/// A node first receives its input item by item between [`start_pre_op`](Stage::start_pre_op)
/// and [`stop_pre_op`](Stage::stop_pre_op), then does its communication-heavy work in
/// [`execute`](Stage::execute), and finally hands its output to the next node in
/// [`push_data`](Stage::push_data), possibly several times. All workers call the phases of the
/// same nodes in the same order.
pub trait Stage {
    /// Items the node consumes.
    type Input;
    /// Items the node produces.
    type Output;

    /// Prepares for input.
    fn start_pre_op(&mut self) -> Result<()>;

    /// Takes one input item.
    fn pre_op(&mut self, item: Self::Input) -> Result<()>;

    /// Ends the input.
    fn stop_pre_op(&mut self) -> Result<()>;

    /// Computes the output.
    fn execute(&mut self) -> Result<()>;

    /// Passes the output to `emit`; with `consume`, the node may release it afterwards.
    fn push_data(&mut self, consume: bool, emit: &mut dyn FnMut(&Self::Output) -> Result<()>) -> Result<()>;

    /// Releases everything the node holds.
    fn dispose(&mut self);
}
