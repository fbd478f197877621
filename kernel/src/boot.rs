//! 引导信息：命令行。

use linker::MultibootInfo;
use spin::Once;

static CMDLINE: Once<&'static str> = Once::new();

/// 记下引导器给的命令行，没有就是空串。
pub fn init(info: &MultibootInfo) {
    let raw = info.cmdline().unwrap_or("");
    CMDLINE.call_once(|| raw);
    if !raw.is_empty() {
        log::info!("cmdline: {raw}");
    }
}

/// 命令行里是否出现某个开关。
pub fn has_option(name: &str) -> bool {
    CMDLINE
        .get()
        .map(|raw| raw.split_whitespace().any(|word| word == name))
        .unwrap_or(false)
}

/// `key=value` 形式选项的值。
pub fn value_of(name: &str) -> Option<&'static str> {
    CMDLINE.get()?.split_whitespace().find_map(|word| {
        let rest = word.strip_prefix(name)?;
        rest.strip_prefix('=')
    })
}
