use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::{
    compiler::{CompileResult, Compiler},
    scanner::TokenType,
};

pub mod build;
pub mod class;
pub mod test_set;

/// A self-contained handler for one declaration keyword. The keyword has
/// already been consumed when `process` runs.
pub trait Compilette {
    fn match_token(&self) -> TokenType;

    fn process(&self, compiler: &mut Compiler) -> CompileResult;
}

#[derive(Default)]
pub struct CompiletteRegistry {
    handlers: FxHashMap<TokenType, Rc<dyn Compilette>>,
}

impl CompiletteRegistry {
    /// Handlers for top-level declarations. Anything unmatched falls back to
    /// the statement grammar.
    pub fn declarations() -> Self {
        let mut registry = CompiletteRegistry::default();
        registry.register(Rc::new(class::ClassCompilette::new()));
        registry.register(Rc::new(build::BuildCompilette));
        registry.register(Rc::new(test_set::TestSetCompilette));
        registry.register(Rc::new(test_set::TestcaseCompilette));
        registry
    }

    pub fn register(&mut self, compilette: Rc<dyn Compilette>) {
        self.handlers.insert(compilette.match_token(), compilette);
    }

    pub fn get(&self, token_type: TokenType) -> Option<Rc<dyn Compilette>> {
        self.handlers.get(&token_type).cloned()
    }
}
