use crate::{BehaviorNode, Context, Lazy, NodeStatus, PortSpec, Symbol, TickResult};

static VALUE: Lazy<Symbol> = Lazy::new(|| "value".into());
static OUTPUT: Lazy<Symbol> = Lazy::new(|| "output".into());
static INPUT: Lazy<Symbol> = Lazy::new(|| "input".into());

pub struct AlwaysSuccess;

impl BehaviorNode for AlwaysSuccess {
    fn tick(&mut self, _ctx: &mut Context) -> TickResult {
        Ok(NodeStatus::Success)
    }
}

pub struct AlwaysFailure;

impl BehaviorNode for AlwaysFailure {
    fn tick(&mut self, _ctx: &mut Context) -> TickResult {
        Ok(NodeStatus::Failure)
    }
}

/// Writes the boolean `value` to `output`.
pub struct SetBool;

impl BehaviorNode for SetBool {
    fn provided_ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::new_in(*VALUE), PortSpec::new_out(*OUTPUT)]
    }

    fn tick(&mut self, ctx: &mut Context) -> TickResult {
        let value = ctx.require_parse::<bool>(*VALUE)?;
        ctx.set(*OUTPUT, value)?;
        Ok(NodeStatus::Success)
    }
}

/// Condition that succeeds if `input` is true.
pub struct IsTrue;

impl BehaviorNode for IsTrue {
    fn provided_ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::new_in(*INPUT)]
    }

    fn tick(&mut self, ctx: &mut Context) -> TickResult {
        if ctx.get_parse::<bool>(*INPUT).unwrap_or(false) {
            Ok(NodeStatus::Success)
        } else {
            Ok(NodeStatus::Failure)
        }
    }
}
