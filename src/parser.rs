mod loader;
mod source;

pub use self::{
    loader::{load, load_yaml},
    source::{NodeDef, TreeDef, TreePortDef, TreeSource},
};
