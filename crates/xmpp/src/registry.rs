use std::collections::BTreeSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, error, info, warn};
use xmpp_parsers::minidom::Element;

use crate::error::{ConfigurationError, ProtocolError};
use crate::module::{ModuleContext, XmppModule};
use crate::stanza::StanzaExt;

/// What happened to a stanza offered to the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// A module accepted and processed the stanza.
    Handled { module: String },
    /// A module accepted the stanza and failed. The error should be sent back.
    Failed { module: String, error: ProtocolError },
    /// No module wanted an iq request, which still needs an answer.
    Unhandled,
    /// No module wanted the stanza and it needs no answer.
    Ignored,
}

impl DispatchOutcome {
    pub fn module(&self) -> Option<&str> {
        match self {
            DispatchOutcome::Handled { module } | DispatchOutcome::Failed { module, .. } => {
                Some(module)
            }
            DispatchOutcome::Unhandled | DispatchOutcome::Ignored => None,
        }
    }
}

/// Ordered set of modules, keyed by module type.
///
/// Dispatch is first match wins, in registration order.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: RwLock<Vec<Arc<dyn XmppModule>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize `module` and add it to the registry.
    ///
    /// Fails without side effects if the type is taken or initialization
    /// fails.
    pub fn register(
        &self,
        module: Arc<dyn XmppModule>,
        ctx: &ModuleContext,
    ) -> Result<(), ConfigurationError> {
        let module_type = module.module_type().to_string();
        if self.contains(&module_type) {
            return Err(ConfigurationError::DuplicateModuleType(module_type));
        }

        // initialize may publish or send, so it runs without the lock held
        module.initialize(ctx)?;

        let mut modules = self.modules.write().unwrap_or_else(PoisonError::into_inner);
        if modules.iter().any(|m| m.module_type() == module_type) {
            return Err(ConfigurationError::DuplicateModuleType(module_type));
        }
        modules.push(module);
        info!(module = %module_type, total = modules.len(), "module registered");
        Ok(())
    }

    pub fn contains(&self, module_type: &str) -> bool {
        self.snapshot()
            .iter()
            .any(|module| module.module_type() == module_type)
    }

    pub fn get(&self, module_type: &str) -> Option<Arc<dyn XmppModule>> {
        self.snapshot()
            .into_iter()
            .find(|module| module.module_type() == module_type)
    }

    pub fn module_types(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .map(|module| module.module_type().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Union of every module's features, sorted and deduplicated.
    pub fn features(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .flat_map(|module| module.features().iter().map(|f| f.to_string()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Hand `stanza` to the first module whose criterion matches it.
    ///
    /// A panicking module is reported as `internal-server-error`.
    pub fn dispatch(&self, stanza: &Element, ctx: &ModuleContext) -> DispatchOutcome {
        let Some(module) = self.snapshot().into_iter().find(|module| {
            module
                .criterion()
                .is_some_and(|criterion| criterion.matches(stanza))
        }) else {
            debug!(
                name = stanza.name(),
                id = stanza.id().unwrap_or_default(),
                "no module matched stanza"
            );
            return if stanza.is_request() {
                DispatchOutcome::Unhandled
            } else {
                DispatchOutcome::Ignored
            };
        };

        let module_type = module.module_type().to_string();
        debug!(module = %module_type, name = stanza.name(), "dispatching stanza");

        match catch_unwind(AssertUnwindSafe(|| module.process(stanza, ctx))) {
            Ok(Ok(())) => DispatchOutcome::Handled {
                module: module_type,
            },
            Ok(Err(error)) => {
                warn!(module = %module_type, %error, "module rejected stanza");
                DispatchOutcome::Failed {
                    module: module_type,
                    error,
                }
            }
            Err(_) => {
                error!(module = %module_type, "module panicked while processing stanza");
                DispatchOutcome::Failed {
                    error: ProtocolError::internal_server_error(format!(
                        "module {module_type} failed"
                    )),
                    module: module_type,
                }
            }
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn XmppModule>> {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
