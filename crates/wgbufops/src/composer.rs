use crate::{Error, Result};
use naga_oil::compose::{
    ComposableModuleDefinition, ComposableModuleDescriptor, Composer, ComposerError,
    NagaModuleDescriptor, ShaderDefValue,
};
use std::collections::HashMap;

/// An extension trait for the naga-oil `Composer`.
pub trait ComposerExt {
    /// Adds a composable module to `self` only if it hasn’t been added yet.
    ///
    /// naga-oil behaves strangely (some symbols stop resolving) if the same module is added
    /// twice. If the module named by the source’s `#define_import_path` already exists,
    /// `self` is left unchanged and `Ok(None)` is returned.
    fn add_composable_module_once(
        &mut self,
        desc: ComposableModuleDescriptor<'_>,
    ) -> std::result::Result<Option<&ComposableModuleDefinition>, ComposerError>;

    /// Composes the top-level shader `source` with the given shader definitions, then runs
    /// naga’s validator on the result.
    fn make_validated_module(
        &mut self,
        file_path: &str,
        source: &str,
        shader_defs: HashMap<String, ShaderDefValue>,
    ) -> Result<naga::Module>;
}

impl ComposerExt for Composer {
    fn add_composable_module_once(
        &mut self,
        desc: ComposableModuleDescriptor<'_>,
    ) -> std::result::Result<Option<&ComposableModuleDefinition>, ComposerError> {
        // NOTE: reading the name from the source is much faster than going through
        //       `Preprocessor::get_preprocessor_metadata`.
        let module_name = desc.source.lines().find_map(|line| {
            line.trim()
                .strip_prefix("#define_import_path")
                .map(|name| name.trim().trim_end_matches(';').trim().to_string())
        });

        if module_name.is_some_and(|name| self.contains_module(&name)) {
            return Ok(None);
        }

        self.add_composable_module(desc).map(Some)
    }

    fn make_validated_module(
        &mut self,
        file_path: &str,
        source: &str,
        shader_defs: HashMap<String, ShaderDefValue>,
    ) -> Result<naga::Module> {
        let module = self
            .make_naga_module(NagaModuleDescriptor {
                source,
                file_path,
                shader_defs,
                ..Default::default()
            })
            .map_err(|source| Error::ShaderComposition {
                path: file_path.to_string(),
                source,
            })?;

        naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        )
        .validate(&module)
        .map_err(|e| Error::ShaderValidation {
            path: file_path.to_string(),
            message: format!("{e:?}"),
        })?;

        Ok(module)
    }
}
