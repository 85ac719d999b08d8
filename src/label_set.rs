use hashbrown::HashMap;

use crate::dictionary::StringDictionary;
use crate::label_checker::LabelChecker;
use crate::LabelId;

/// A two-tier table of label names.
///
/// Names already interned in the shared [`StringDictionary`] resolve to their
/// global ids; names first seen in a request get ids past the end of the
/// dictionary arena and live only as long as the request. Validity of local
/// labels is decided once at insertion from the checker's string rules.
#[derive(Clone)]
pub(crate) struct LabelSet<'a> {
    dict: &'a StringDictionary,
    checker: &'a LabelChecker,
    dict_len: usize,
    local_by_name: HashMap<String, usize>,
    local_names: Vec<String>,
    local_valid: Vec<bool>,
}

impl<'a> LabelSet<'a> {
    pub(crate) fn new(dict: &'a StringDictionary, checker: &'a LabelChecker) -> Self {
        Self {
            dict,
            checker,
            dict_len: dict.data_len(),
            local_by_name: HashMap::new(),
            local_names: vec![],
            local_valid: vec![],
        }
    }

    /// Returns the id for a name, allocating a request-local id if the name
    /// is not in the dictionary.
    pub(crate) fn add_label(&mut self, name: &str) -> LabelId {
        if let Some(id) = self.dict.find(name) {
            return id;
        }
        if let Some(&idx) = self.local_by_name.get(name) {
            return (self.dict_len + idx) as LabelId;
        }
        let idx = self.local_names.len();
        self.local_by_name.insert(name.to_string(), idx);
        self.local_names.push(name.to_string());
        self.local_valid.push(self.checker.is_valid_string(name));
        (self.dict_len + idx) as LabelId
    }

    pub(crate) fn name(&self, label: LabelId) -> &str {
        let label = label as usize;
        if label >= self.dict_len {
            &self.local_names[label - self.dict_len]
        } else {
            self.dict.get(label as LabelId)
        }
    }

    pub(crate) fn is_valid(&self, label: LabelId) -> bool {
        if label < 0 {
            return false;
        }
        let idx = label as usize;
        if idx >= self.dict_len {
            self.local_valid[idx - self.dict_len]
        } else {
            self.checker.is_valid(label)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_ids_resolve_to_dictionary() {
        let mut dict = StringDictionary::new();
        let foo = dict.add("foo");
        let checker = LabelChecker::new();
        let mut set = LabelSet::new(&dict, &checker);
        assert_eq!(set.add_label("foo"), foo);
        assert_eq!(set.name(foo), "foo");
    }

    #[test]
    fn test_local_ids_start_past_the_arena() {
        let mut dict = StringDictionary::new();
        dict.add("foo");
        let checker = LabelChecker::new();
        let mut set = LabelSet::new(&dict, &checker);
        let bar = set.add_label("bar");
        let baz = set.add_label("baz");
        assert!(bar as usize >= dict.data_len());
        assert_ne!(bar, baz);
        assert_eq!(set.add_label("bar"), bar);
        assert_eq!(set.name(bar), "bar");
        assert_eq!(set.name(baz), "baz");
    }

    #[test]
    fn test_local_validity_from_string_rules() {
        let mut dict = StringDictionary::new();
        dict.add("known");
        let mut checker = LabelChecker::new();
        checker.load_str("+known\n-scratch.*\n", &dict).unwrap();
        let mut set = LabelSet::new(&dict, &checker);
        let fresh = set.add_label("fresh");
        let scratch = set.add_label("scratch_1");
        // Local names start valid and only matching rules flip them.
        assert!(set.is_valid(fresh));
        assert!(!set.is_valid(scratch));
        assert!(set.is_valid(dict.find("known").unwrap()));
        assert!(!set.is_valid(-1));
    }
}
