//! Pure predicates over `(source group, is main, target folder)`. No I/O, no state.

use crate::domain::GroupFolder;

#[derive(Clone, Copy, Debug)]
pub struct AuthorizationPolicy;

impl AuthorizationPolicy {
    pub fn can_register_group(is_main_source: bool) -> bool {
        is_main_source
    }

    pub fn can_refresh_groups(is_main_source: bool) -> bool {
        is_main_source
    }

    pub fn can_send_message(
        is_main_source: bool,
        source: &GroupFolder,
        target: &GroupFolder,
    ) -> bool {
        is_main_source || source == target
    }

    pub fn can_schedule_task(
        is_main_source: bool,
        source: &GroupFolder,
        target: &GroupFolder,
    ) -> bool {
        is_main_source || source == target
    }

    pub fn can_manage_task(
        is_main_source: bool,
        source: &GroupFolder,
        task_folder: &GroupFolder,
    ) -> bool {
        is_main_source || source == task_folder
    }

    pub fn can_manage_session(
        is_main_source: bool,
        source: &GroupFolder,
        target: &GroupFolder,
    ) -> bool {
        is_main_source || source == target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_main_source_is_confined_to_its_own_folder() {
        let source = GroupFolder("alpha".to_string());
        let other = GroupFolder("beta".to_string());

        assert!(!AuthorizationPolicy::can_register_group(false));
        assert!(!AuthorizationPolicy::can_refresh_groups(false));
        assert!(!AuthorizationPolicy::can_send_message(false, &source, &other));
        assert!(!AuthorizationPolicy::can_schedule_task(false, &source, &other));
        assert!(!AuthorizationPolicy::can_manage_task(false, &source, &other));
        assert!(!AuthorizationPolicy::can_manage_session(false, &source, &other));

        assert!(AuthorizationPolicy::can_send_message(false, &source, &source));
        assert!(AuthorizationPolicy::can_schedule_task(false, &source, &source));
    }

    #[test]
    fn main_source_may_act_on_any_target() {
        let source = GroupFolder("main".to_string());
        let other = GroupFolder("beta".to_string());

        assert!(AuthorizationPolicy::can_register_group(true));
        assert!(AuthorizationPolicy::can_refresh_groups(true));
        assert!(AuthorizationPolicy::can_send_message(true, &source, &other));
        assert!(AuthorizationPolicy::can_schedule_task(true, &source, &other));
        assert!(AuthorizationPolicy::can_manage_task(true, &source, &other));
        assert!(AuthorizationPolicy::can_manage_session(true, &source, &other));
    }
}
