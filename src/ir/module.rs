//! Modules: globals, functions and constructors.

use crate::{
    ir::{
        builder::{FunctionBuilder, FunctionContext},
        Constant, DataLayout, FuncId, Function, FunctionType, GlobalId, PointerWidth, Type,
    },
    Error, Result,
};

/// A global variable.
///
/// A global without initializer is an external declaration: its storage is defined elsewhere
/// and its extent is unknown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalVariable {
    id: GlobalId,
    name: String,
    value_type: Type,
    initializer: Option<Constant>,
    constant: bool,
}

impl GlobalVariable {
    /// The global's handle.
    #[must_use]
    pub const fn id(&self) -> GlobalId {
        self.id
    }

    /// The symbol name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type of the stored value.
    #[must_use]
    pub const fn value_type(&self) -> &Type {
        &self.value_type
    }

    /// The initializer, `None` for external declarations.
    #[must_use]
    pub const fn initializer(&self) -> Option<&Constant> {
        self.initializer.as_ref()
    }

    /// Returns `true` if the global is read-only.
    #[must_use]
    pub const fn is_constant(&self) -> bool {
        self.constant
    }

    /// Returns `true` for declarations without storage in this module.
    #[must_use]
    pub const fn is_external(&self) -> bool {
        self.initializer.is_none()
    }

    /// Type of the global's address.
    #[must_use]
    pub fn pointer_type(&self) -> Type {
        Type::ptr(self.value_type.clone())
    }

    /// The global's address as a constant.
    #[must_use]
    pub fn address(&self) -> Constant {
        Constant::Global {
            id: self.id,
            ty: self.pointer_type(),
        }
    }
}

/// A translation unit.
#[derive(Debug, Clone)]
pub struct Module {
    name: String,
    pointer_width: PointerWidth,
    globals: Vec<GlobalVariable>,
    functions: Vec<Function>,
    constructors: Vec<FuncId>,
}

impl Module {
    /// Creates an empty module.
    #[must_use]
    pub fn new(name: impl Into<String>, pointer_width: PointerWidth) -> Self {
        Module {
            name: name.into(),
            pointer_width,
            globals: Vec::new(),
            functions: Vec::new(),
            constructors: Vec::new(),
        }
    }

    /// The module name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The target pointer width.
    #[must_use]
    pub const fn pointer_width(&self) -> PointerWidth {
        self.pointer_width
    }

    /// Layout rules for this module's target.
    #[must_use]
    pub const fn data_layout(&self) -> DataLayout {
        DataLayout::new(self.pointer_width)
    }

    /// Adds a mutable global. `None` declares an external global.
    pub fn add_global(
        &mut self,
        name: impl Into<String>,
        value_type: Type,
        initializer: Option<Constant>,
    ) -> GlobalId {
        self.push_global(name.into(), value_type, initializer, false)
    }

    /// Adds a read-only global.
    pub fn add_constant_global(
        &mut self,
        name: impl Into<String>,
        value_type: Type,
        initializer: Constant,
    ) -> GlobalId {
        self.push_global(name.into(), value_type, Some(initializer), true)
    }

    fn push_global(
        &mut self,
        name: String,
        value_type: Type,
        initializer: Option<Constant>,
        constant: bool,
    ) -> GlobalId {
        // Global counts are bounded by the u32 index space
        #[allow(clippy::cast_possible_truncation)]
        let id = GlobalId::new(self.globals.len() as u32);
        self.globals.push(GlobalVariable {
            id,
            name,
            value_type,
            initializer,
            constant,
        });
        id
    }

    /// All globals in declaration order.
    #[must_use]
    pub fn globals(&self) -> &[GlobalVariable] {
        &self.globals
    }

    /// Mutable access to the initializers of all defined globals.
    pub fn initializers_mut(&mut self) -> impl Iterator<Item = &mut Constant> + '_ {
        self.globals.iter_mut().filter_map(|g| g.initializer.as_mut())
    }

    /// Looks up a global.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownGlobal`] for a dangling handle.
    pub fn global(&self, id: GlobalId) -> Result<&GlobalVariable> {
        self.globals.get(id.index()).ok_or(Error::UnknownGlobal(id))
    }

    /// Looks up a global by name.
    #[must_use]
    pub fn global_by_name(&self, name: &str) -> Option<GlobalId> {
        self.globals.iter().find(|g| g.name == name).map(|g| g.id)
    }

    /// The address of a global as a constant operand.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownGlobal`] for a dangling handle.
    pub fn global_ref(&self, id: GlobalId) -> Result<Constant> {
        Ok(self.global(id)?.address())
    }

    /// Declares a function, or returns the existing function of that name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIr`] if a function of that name exists with another signature.
    pub fn declare_function(
        &mut self,
        name: impl Into<String>,
        signature: FunctionType,
    ) -> Result<FuncId> {
        let name = name.into();
        if let Some(existing) = self.function_by_name(&name) {
            let function = self.function(existing)?;
            if *function.signature() != signature {
                return Err(Error::InvalidIr(format!(
                    "'{name}' redeclared as {signature}, previously {}",
                    function.signature()
                )));
            }
            return Ok(existing);
        }

        // Function counts are bounded by the u32 index space
        #[allow(clippy::cast_possible_truncation)]
        let id = FuncId::new(self.functions.len() as u32);
        self.functions.push(Function::new(id, name, signature));
        Ok(id)
    }

    /// Declares (if needed) and defines a function, building its body with a closure.
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// let id = module.define_function("id", FunctionType::new(ptr.clone(), vec![ptr]), |f| {
    ///     let p = f.arg(0);
    ///     f.block(0, |b| b.ret(Some(p.into())));
    /// })?;
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIr`] if the function already has a body, if the signature
    /// conflicts with an earlier declaration, or if the builder rejected an instruction.
    pub fn define_function<F>(
        &mut self,
        name: impl Into<String>,
        signature: FunctionType,
        build: F,
    ) -> Result<FuncId>
    where
        F: FnOnce(&mut FunctionContext<'_, '_>),
    {
        let name = name.into();
        let id = self.declare_function(name.clone(), signature)?;
        let declaration = self.function(id)?.clone();
        if !declaration.is_declaration() {
            return Err(Error::InvalidIr(format!("'{name}' is already defined")));
        }

        let function = FunctionBuilder::new(self, declaration).build_with(build)?;
        self.functions[id.index()] = function;
        Ok(id)
    }

    /// All functions in declaration order.
    #[must_use]
    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    /// Looks up a function.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownFunction`] for a dangling handle.
    pub fn function(&self, id: FuncId) -> Result<&Function> {
        self.functions.get(id.index()).ok_or(Error::UnknownFunction(id))
    }

    /// Looks up a function for modification.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownFunction`] for a dangling handle.
    pub fn function_mut(&mut self, id: FuncId) -> Result<&mut Function> {
        self.functions
            .get_mut(id.index())
            .ok_or(Error::UnknownFunction(id))
    }

    /// Looks up a function by name.
    #[must_use]
    pub fn function_by_name(&self, name: &str) -> Option<FuncId> {
        self.functions
            .iter()
            .find(|f| f.name() == name)
            .map(Function::id)
    }

    /// The address of a function as a constant operand.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownFunction`] for a dangling handle.
    pub fn function_ref(&self, id: FuncId) -> Result<Constant> {
        let function = self.function(id)?;
        Ok(Constant::Function {
            id,
            ty: function.pointer_type(),
        })
    }

    /// Renames a function.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIr`] if the new name is taken.
    pub fn rename_function(&mut self, id: FuncId, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        if self.function_by_name(&name).is_some_and(|other| other != id) {
            return Err(Error::InvalidIr(format!("function name '{name}' is taken")));
        }
        self.function_mut(id)?.set_name(name);
        Ok(())
    }

    /// Functions run at module initialisation, in registration order.
    #[must_use]
    pub fn constructors(&self) -> &[FuncId] {
        &self.constructors
    }

    /// Registers a module constructor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownFunction`] for a dangling handle.
    pub fn add_constructor(&mut self, id: FuncId) -> Result<()> {
        self.function(id)?;
        if !self.constructors.contains(&id) {
            self.constructors.push(id);
        }
        Ok(())
    }
}
