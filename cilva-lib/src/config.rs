/// A static method or instance method named by class, name and JVM descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodSpec {
    pub class : String,
    pub name : String,
    pub descriptor : String,
}

impl MethodSpec {
    pub fn new(class : &str, name : &str, descriptor : &str) -> MethodSpec {
        MethodSpec { class : class.to_owned(), name : name.to_owned(), descriptor : descriptor.to_owned() }
    }
}

/// Runtime-support class used to carry a `leave` destination through a finally clause.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentinelSpec {
    pub class : String,
    /// static factory taking the destination index, `(I)L<class>;`
    pub factory : String,
    /// instance accessor returning the destination index, `()I`
    pub accessor : String,
}

/// Names of the runtime support a translated method links against, plus the knobs of
/// exception-region reconstruction.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub object_class : String,
    pub throwable_class : String,
    pub string_class : String,
    /// class used for by-reference boxes
    pub reference_cell_class : String,
    /// catch types that match every exception without a type test
    pub universal_exceptions : Vec<String>,
    /// supertype walks stop here
    pub exception_root : Option<String>,
    /// `(Ljava/lang/Throwable;)Ljava/lang/Throwable;`, called once per region before any catch test
    pub exception_mapper : MethodSpec,
    pub leave_sentinel : SentinelSpec,
    /// `(Ljava/lang/Object;Ljava/lang/String;)Ljava/lang/Object;`, null when the exception does
    /// not match the named generic parameter
    pub generic_catch : MethodSpec,
    /// instance method on value classes returning a detached copy
    pub value_clone : String,
    /// catch types the JVM itself throws under another name
    pub host_exception_aliases : Vec<String>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            object_class : "java/lang/Object".to_owned(),
            throwable_class : "java/lang/Throwable".to_owned(),
            string_class : "java/lang/String".to_owned(),
            reference_cell_class : "system/Reference".to_owned(),
            universal_exceptions : vec![ "system/Exception".to_owned(), "java/lang/Throwable".to_owned() ],
            exception_root : Some("system/Exception".to_owned()),
            exception_mapper : MethodSpec::new(
                "system/Util", "TranslateException", "(Ljava/lang/Throwable;)Ljava/lang/Throwable;"),
            leave_sentinel : SentinelSpec {
                class : "system/LeaveTarget".to_owned(),
                factory : "create".to_owned(),
                accessor : "index".to_owned(),
            },
            generic_catch : MethodSpec::new(
                "system/GenericUtil", "TryCast", "(Ljava/lang/Object;Ljava/lang/String;)Ljava/lang/Object;"),
            value_clone : "system-ValueMethod-Clone".to_owned(),
            host_exception_aliases : vec![
                "system/ArithmeticException".to_owned(),
                "system/NullReferenceException".to_owned(),
                "system/IndexOutOfRangeException".to_owned(),
                "system/InvalidCastException".to_owned(),
                "system/StackOverflowException".to_owned(),
                "system/OutOfMemoryException".to_owned(),
            ],
        }
    }
}

impl Config {
    pub fn sentinel_factory_descriptor(&self) -> String {
        format!("(I)L{};", self.leave_sentinel.class)
    }

    pub fn is_universal_exception(&self, class : &str) -> bool {
        class == self.throwable_class || self.universal_exceptions.iter().any(|u| u == class)
    }

    pub fn is_host_alias(&self, class : &str) -> bool {
        self.host_exception_aliases.iter().any(|h| h == class)
    }
}
