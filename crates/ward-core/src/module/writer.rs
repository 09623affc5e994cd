//! WMOD container writer.

use super::{MethodBody, Module, ModuleError, RuntimeHelper, MODULE_MAGIC, MODULE_VERSION};

// ---------------------------------------------------------------------------
// Little-endian write helpers
// ---------------------------------------------------------------------------

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_str(buf: &mut Vec<u8>, value: &str) -> Result<(), ModuleError> {
    let len = u16::try_from(value.len()).map_err(|_| ModuleError::TooMany {
        what: "string byte",
        count: value.len(),
    })?;
    put_u16(buf, len);
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

fn put_blob(buf: &mut Vec<u8>, what: &'static str, data: &[u8]) -> Result<(), ModuleError> {
    let len = u32::try_from(data.len()).map_err(|_| ModuleError::TooMany {
        what,
        count: data.len(),
    })?;
    put_u32(buf, len);
    buf.extend_from_slice(data);
    Ok(())
}

fn put_helpers(
    buf: &mut Vec<u8>,
    what: &'static str,
    helpers: &[RuntimeHelper],
) -> Result<(), ModuleError> {
    let count = u8::try_from(helpers.len()).map_err(|_| ModuleError::TooMany {
        what,
        count: helpers.len(),
    })?;
    buf.push(count);
    buf.extend(helpers.iter().map(|h| *h as u8));
    Ok(())
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Serialize a module to the WMOD container format.
pub fn write_module(module: &Module) -> Result<Vec<u8>, ModuleError> {
    let mut buf = Vec::new();
    put_u32(&mut buf, MODULE_MAGIC);
    put_u16(&mut buf, MODULE_VERSION);
    put_str(&mut buf, &module.name)?;

    let method_count = u32::try_from(module.methods.len()).map_err(|_| ModuleError::TooMany {
        what: "method",
        count: module.methods.len(),
    })?;
    put_u32(&mut buf, method_count);
    for method in &module.methods {
        put_u32(&mut buf, method.token.0);
        put_str(&mut buf, &method.name)?;
        buf.push(method.params);
        put_u16(&mut buf, method.flags.0);
        match &method.body {
            MethodBody::Code(code) => {
                buf.push(0);
                put_blob(&mut buf, "method body byte", code)?;
            }
            MethodBody::Sealed => buf.push(1),
        }
    }

    let section_count = u16::try_from(module.sections.len()).map_err(|_| ModuleError::TooMany {
        what: "section",
        count: module.sections.len(),
    })?;
    put_u16(&mut buf, section_count);
    for section in &module.sections {
        put_str(&mut buf, &section.name)?;
        put_blob(&mut buf, "section byte", &section.data)?;
    }

    put_helpers(&mut buf, "initializer", &module.initializers)?;
    put_helpers(&mut buf, "invoke hook", &module.invoke_hooks)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_module_layout() {
        let bytes = write_module(&Module::new("m")).unwrap();
        // magic + version + "m" + method count + section count + 2 helper counts
        assert_eq!(bytes.len(), 4 + 2 + 3 + 4 + 2 + 1 + 1);
        assert_eq!(&bytes[..4], b"WMOD");
    }

    #[test]
    fn test_oversized_name_rejected() {
        let module = Module::new("x".repeat(70_000));
        assert!(matches!(
            write_module(&module),
            Err(ModuleError::TooMany { what: "string byte", .. })
        ));
    }
}
