use rquickjs::{Ctx, Function, Object};
use tracing::{debug, error, info, warn};

/// Routes one formatted `console.*` line into tracing.
pub(crate) fn emit_console_line(extension: &str, level: &str, message: &str) {
    match level {
        "error" => error!(target: "extension_console", extension = %extension, "{message}"),
        "warn" => warn!(target: "extension_console", extension = %extension, "{message}"),
        "debug" => debug!(target: "extension_console", extension = %extension, "{message}"),
        _ => info!(target: "extension_console", extension = %extension, "{message}"),
    }
}

pub(crate) fn install<'js>(ctx: &Ctx<'js>, host: &Object<'js>, extension: &str) -> rquickjs::Result<()> {
    let extension = extension.to_string();
    host.set(
        "consoleWrite",
        Function::new(ctx.clone(), move |level: String, message: String| {
            emit_console_line(&extension, &level, &message);
        })?,
    )
}
