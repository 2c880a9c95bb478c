#![no_main]
use encmount::modules::transport::MountSettings;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|args: Vec<String>| {
    if let Ok(settings) = MountSettings::parse(&args) {
        assert!(!settings.mount_point.as_os_str().is_empty());
    }
});
